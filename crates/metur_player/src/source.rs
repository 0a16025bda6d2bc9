//! PCM 帧源
//!
//! 把解码进程的推式字节流适配为按帧数请求的拉式读取。

use std::io::{ErrorKind, Read};

use crate::PcmStream;

/// 帧对齐的拉式 PCM 源
///
/// 有限且不可重启：一旦返回空缓冲区（流结束），后续读取都返回空。
pub struct PcmFrameSource<R = PcmStream> {
    reader: R,
    bytes_per_frame: usize,
    /// 等待首帧时已读入、尚未交给调用方的字节
    pending: Vec<u8>,
    primed: bool,
    exhausted: bool,
}

impl<R: Read> PcmFrameSource<R> {
    pub fn new(reader: R, channel_count: u16, sample_width_bytes: u16) -> Self {
        Self {
            reader,
            bytes_per_frame: (channel_count as usize * sample_width_bytes as usize).max(1),
            pending: Vec::new(),
            primed: false,
            exhausted: false,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    /// 请求/响应协议的第一次应答：总是空缓冲区
    pub fn prime(&mut self) -> Vec<u8> {
        self.primed = true;
        Vec::new()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// 阻塞直到至少读到一整帧，或流在此之前结束
    ///
    /// 读到的字节保留给后续的 `read_frames`。返回 false 表示解码器没有产出任何音频。
    pub fn wait_for_audio(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        let mut buf = [0u8; 4096];
        while self.pending.len() < self.bytes_per_frame {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("PCM read failed before first frame: {}", e);
                    break;
                }
            }
        }
        if self.pending.len() < self.bytes_per_frame {
            self.pending.clear();
            self.exhausted = true;
            return false;
        }
        true
    }

    /// 读取 `frames` 帧
    ///
    /// 返回 `frames * bytes_per_frame` 字节；流结束时返回较短的（按整帧截断）
    /// 缓冲区，之后返回空缓冲区。请求 0 帧返回空但不结束流。
    pub fn read_frames(&mut self, frames: usize) -> Vec<u8> {
        if self.exhausted || frames == 0 {
            return Vec::new();
        }

        let required = frames * self.bytes_per_frame;
        let mut buf = vec![0u8; required];
        let mut filled = self.pending.len().min(required);
        buf[..filled].copy_from_slice(&self.pending[..filled]);
        self.pending.drain(..filled);

        while filled < required {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("PCM read failed, treating as end of stream: {}", e);
                    break;
                }
            }
        }

        if filled < required {
            self.exhausted = true;
            filled -= filled % self.bytes_per_frame;
        }
        buf.truncate(filled);
        buf
    }

    /// 转为每次产出 `frames` 帧的迭代器，遇到空缓冲区结束
    pub fn chunks(mut self, frames: usize) -> FrameChunks<R> {
        if !self.primed {
            self.prime();
        }
        FrameChunks {
            source: self,
            frames,
        }
    }
}

/// [`PcmFrameSource::chunks`] 返回的迭代器
pub struct FrameChunks<R> {
    source: PcmFrameSource<R>,
    frames: usize,
}

impl<R: Read> Iterator for FrameChunks<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let chunk = self.source.read_frames(self.frames);
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}
