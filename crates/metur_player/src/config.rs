//! 播放器配置

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 配置加载错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// 播放器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 外部解码程序（ffmpeg 兼容的命令行）
    pub decoder_program: PathBuf,
    /// `thread_play` 的轮询间隔
    pub poll_interval_ms: u64,
    /// 每次从解码输出拉取的帧数
    pub period_frames: usize,
    /// 解码线程与音频回调之间的缓冲块数
    pub queue_depth: usize,
    pub initial_volume: f32,
    pub loop_enabled: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder_program: PathBuf::from("ffmpeg"),
            poll_interval_ms: 10,
            period_frames: 1024,
            queue_depth: 8,
            initial_volume: 1.0,
            loop_enabled: false,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载，缺失的字段使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
