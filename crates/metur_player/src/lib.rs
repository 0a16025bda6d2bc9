//! metur_player - 流式播放传输层
//!
//! 通过外部解码进程把任意压缩音频解码为 PCM，再由低延迟输出设备按需拉取。
//! 对外提供播放、暂停、停止、近似跳转、音量、循环以及基于挂钟的播放位置。

mod clock;
mod command;
mod config;
mod decoder;
mod engine;
mod error;
mod media;
mod output;
mod source;

#[cfg(test)]
pub(crate) mod test_support;

pub use clock::*;
pub use command::*;
pub use config::*;
pub use decoder::*;
pub use engine::*;
pub use error::*;
pub use media::*;
pub use output::*;
pub use source::*;
