//! 播放错误

use std::path::PathBuf;

/// 传输层错误
///
/// 这些错误都在引擎内部恢复：会话回到 `Stopped`，失败尝试的资源被释放，
/// 错误只写日志，不会穿过命令方法返回给 UI。
#[derive(thiserror::Error, Debug)]
pub enum PlayerError {
    #[error("Media unreadable: {}: {reason}", path.display())]
    MediaUnreadable { path: PathBuf, reason: String },
    #[error("Decoder failed to start: {0}")]
    DecodeSpawnFailure(String),
    #[error("Audio device unavailable: {0}")]
    DeviceOpenFailure(String),
}

impl PlayerError {
    pub(crate) fn unreadable(path: &std::path::Path, reason: impl ToString) -> Self {
        PlayerError::MediaUnreadable {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
