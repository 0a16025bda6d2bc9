//! 播放命令和状态定义

use std::path::PathBuf;

/// 播放器命令（UI -> 引擎）
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    /// 加载并播放文件
    Load(PathBuf),
    /// 播放
    Play,
    /// 暂停
    Pause,
    /// 在播放和暂停之间切换
    Toggle,
    /// 停止
    Stop,
    /// 跳转到指定位置（毫秒）
    Seek(u64),
    /// 设置音量 (0.0 - 1.0)
    SetVolume(f32),
    /// 开关循环播放
    SetLoop(bool),
    /// 关闭引擎
    Shutdown,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}
