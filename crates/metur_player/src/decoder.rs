//! 外部解码进程
//!
//! 启动 ffmpeg 兼容的解码管线，从指定秒数开始向 stdout 输出 s16le 交错 PCM。
//! 解码器无法在已打开的流内跳转，跳转通过“终止并在新偏移处重启”实现。

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::{MediaHandle, PlayerError};

/// 解码输出字节流
pub type PcmStream = Box<dyn Read + Send>;

/// 解码进程的生命周期操作
pub trait DecodeProcess: Send {
    /// 请求结束进程，对已退出的进程也必须安全
    fn terminate(&mut self) -> io::Result<()>;
    /// 进程是否已经退出
    fn has_exited(&mut self) -> io::Result<bool>;
}

impl DecodeProcess for Child {
    fn terminate(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        match self.kill() {
            Ok(()) => {}
            // 在 try_wait 与 kill 之间退出
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.wait().map(|_| ())
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }
}

/// 解码请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRequest {
    pub path: PathBuf,
    /// 起始偏移（整秒）
    pub start_offset_secs: u64,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl DecodeRequest {
    /// 按毫秒位置构造请求，偏移向下取整到秒
    pub fn for_media(media: &MediaHandle, position_ms: u64) -> Self {
        Self {
            path: media.path.clone(),
            start_offset_secs: position_ms / 1000,
            sample_rate: media.sample_rate,
            channel_count: media.channel_count,
        }
    }
}

/// 一个正在运行的解码管线
pub struct DecoderHandle {
    process: Box<dyn DecodeProcess>,
    output: Option<PcmStream>,
    alive: bool,
}

impl DecoderHandle {
    pub fn new(process: Box<dyn DecodeProcess>, output: PcmStream) -> Self {
        Self {
            process,
            output: Some(output),
            alive: true,
        }
    }

    /// 取走输出流（只能取一次）
    pub fn take_output(&mut self) -> Option<PcmStream> {
        self.output.take()
    }

    /// 进程仍在运行
    pub fn is_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match self.process.has_exited() {
            Ok(exited) => {
                self.alive = !exited;
            }
            Err(e) => {
                log::warn!("Failed to poll decoder process: {}", e);
                self.alive = false;
            }
        }
        self.alive
    }

    /// 终止进程并释放输出流，可重复调用
    pub fn terminate(&mut self) {
        self.output.take();
        if std::mem::replace(&mut self.alive, false) || self.process_running() {
            if let Err(e) = self.process.terminate() {
                log::warn!("Failed to terminate decoder process: {}", e);
            }
        }
    }

    fn process_running(&mut self) -> bool {
        matches!(self.process.has_exited(), Ok(false))
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// 解码后端
pub trait PcmDecoder: Send + Sync {
    fn start(&self, request: &DecodeRequest) -> Result<DecoderHandle, PlayerError>;
}

/// ffmpeg 子进程解码器
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    program: PathBuf,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// 构建命令行：输入端 -ss 快速定位，输出 s16le 到 stdout
    pub fn command(&self, request: &DecodeRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-v", "fatal", "-hide_banner", "-nostdin"])
            .arg("-ss")
            .arg(request.start_offset_secs.to_string())
            .arg("-i")
            .arg(&request.path)
            .args(["-f", "s16le", "-acodec", "pcm_s16le"])
            .arg("-ac")
            .arg(request.channel_count.to_string())
            .arg("-ar")
            .arg(request.sample_rate.to_string())
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl PcmDecoder for FfmpegDecoder {
    fn start(&self, request: &DecodeRequest) -> Result<DecoderHandle, PlayerError> {
        let mut child = self.command(request).spawn().map_err(|e| {
            PlayerError::DecodeSpawnFailure(format!("{}: {}", self.program.display(), e))
        })?;

        let stdout = match child.stdout.take() {
            Some(out) => out,
            None => {
                let _ = child.terminate();
                return Err(PlayerError::DecodeSpawnFailure(
                    "decoder stdout not captured".into(),
                ));
            }
        };

        log::debug!(
            "Decoder started for {} at {}s",
            request.path.display(),
            request.start_offset_secs
        );

        Ok(DecoderHandle::new(Box::new(child), Box::new(stdout)))
    }
}
