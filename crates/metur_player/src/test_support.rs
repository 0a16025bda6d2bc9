//! 测试替身：记录资源数量的探测器、解码器和输出设备

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    AudioBackend, DecodeProcess, DecodeRequest, DecoderHandle, MediaHandle, MediaProbe,
    PcmDecoder, PcmFrameSource, PlaybackDevice, PlayerError, SharedVolume, PCM_SAMPLE_WIDTH,
};

/// 所有替身共享的资源计数
#[derive(Default)]
pub(crate) struct Tally {
    decoders_alive: AtomicUsize,
    decoders_started: AtomicUsize,
    devices_open: AtomicUsize,
    devices_running: AtomicUsize,
    offsets: Mutex<Vec<u64>>,
    exit_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Tally {
    pub fn decoders_alive(&self) -> usize {
        self.decoders_alive.load(Ordering::SeqCst)
    }

    pub fn decoders_started(&self) -> usize {
        self.decoders_started.load(Ordering::SeqCst)
    }

    pub fn devices_open(&self) -> usize {
        self.devices_open.load(Ordering::SeqCst)
    }

    pub fn devices_running(&self) -> usize {
        self.devices_running.load(Ordering::SeqCst)
    }

    /// 每次启动解码器时请求的起始秒数
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }

    /// 让当前所有解码进程表现为已自然退出
    pub fn exit_running_decoders(&self) {
        for flag in self.exit_flags.lock().iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProbe {
    media: HashMap<PathBuf, (u64, Duration)>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(self, path: &str, duration_ms: u64) -> Self {
        self.with_slow_media(path, duration_ms, Duration::ZERO)
    }

    pub fn with_slow_media(mut self, path: &str, duration_ms: u64, delay: Duration) -> Self {
        self.media.insert(PathBuf::from(path), (duration_ms, delay));
        self
    }
}

impl MediaProbe for FakeProbe {
    fn probe(&self, path: &Path) -> Result<MediaHandle, PlayerError> {
        let (duration_ms, delay) = self
            .media
            .get(path)
            .copied()
            .ok_or_else(|| PlayerError::unreadable(path, "no such file"))?;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(MediaHandle {
            path: path.to_path_buf(),
            duration_ms,
            sample_rate: 44100,
            channel_count: 2,
            sample_width_bytes: PCM_SAMPLE_WIDTH,
        })
    }
}

pub(crate) struct FakeDecoder {
    tally: Arc<Tally>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeDecoder {
    pub fn new(tally: Arc<Tally>) -> Self {
        Self {
            tally,
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// 每次启动前先阻塞一段时间，模拟缓慢的进程创建
    pub fn delay_starts(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_next_starts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PcmDecoder for FakeDecoder {
    fn start(&self, request: &DecodeRequest) -> Result<DecoderHandle, PlayerError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlayerError::DecodeSpawnFailure("fake decoder refused".into()));
        }
        let exited = Arc::new(AtomicBool::new(false));
        self.tally.decoders_started.fetch_add(1, Ordering::SeqCst);
        self.tally.decoders_alive.fetch_add(1, Ordering::SeqCst);
        self.tally.offsets.lock().push(request.start_offset_secs);
        self.tally.exit_flags.lock().push(exited.clone());

        let process = FakeProcess {
            tally: self.tally.clone(),
            exited,
        };
        Ok(DecoderHandle::new(Box::new(process), Box::new(io::repeat(0))))
    }
}

struct FakeProcess {
    tally: Arc<Tally>,
    exited: Arc<AtomicBool>,
}

impl DecodeProcess for FakeProcess {
    fn terminate(&mut self) -> io::Result<()> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst))
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.tally.decoders_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeAudio {
    tally: Arc<Tally>,
    fail: AtomicBool,
}

impl FakeAudio {
    pub fn new(tally: Arc<Tally>) -> Self {
        Self {
            tally,
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_next_opens(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl AudioBackend for FakeAudio {
    fn open_device(
        &self,
        _sample_rate: u32,
        _channel_count: u16,
        _volume: SharedVolume,
    ) -> Result<Box<dyn PlaybackDevice>, PlayerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlayerError::DeviceOpenFailure("fake device unplugged".into()));
        }
        self.tally.devices_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            tally: self.tally.clone(),
            source: None,
            running: false,
            closed: false,
        }))
    }
}

struct FakeDevice {
    tally: Arc<Tally>,
    source: Option<PcmFrameSource>,
    running: bool,
    closed: bool,
}

impl FakeDevice {
    fn set_running(&mut self, running: bool) {
        if self.running != running {
            self.running = running;
            if running {
                self.tally.devices_running.fetch_add(1, Ordering::SeqCst);
            } else {
                self.tally.devices_running.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl PlaybackDevice for FakeDevice {
    fn start(&mut self, mut source: PcmFrameSource) -> Result<(), PlayerError> {
        if self.closed || self.source.is_some() {
            return Err(PlayerError::DeviceOpenFailure("fake device not startable".into()));
        }
        source.prime();
        self.source = Some(source);
        self.set_running(true);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlayerError> {
        match &self.source {
            Some(source) if !self.closed && !source.is_exhausted() => {
                self.set_running(true);
                Ok(())
            }
            _ => Err(PlayerError::DeviceOpenFailure("nothing to resume".into())),
        }
    }

    fn stop(&mut self) {
        self.set_running(false);
    }

    fn close(&mut self) {
        self.stop();
        if !std::mem::replace(&mut self.closed, true) {
            self.source = None;
            self.tally.devices_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.close();
    }
}
