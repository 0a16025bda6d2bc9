//! 音频输出
//!
//! 使用 cpal 进行音频播放。cpal 的 `Stream` 不能跨线程移动，
//! 所以每个设备都有自己的线程持有 stream，并通过通道接收控制命令。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::{PcmFrameSource, PlayerError};

/// 在控制线程与音频回调之间共享的音量
#[derive(Debug, Clone)]
pub struct SharedVolume(Arc<AtomicU32>);

impl SharedVolume {
    pub fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(clamp_volume(volume).to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
    }
}

impl Default for SharedVolume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// 一个已打开的输出设备
pub trait PlaybackDevice: Send {
    /// 绑定帧源并开始由设备回调拉取
    fn start(&mut self, source: PcmFrameSource) -> Result<(), PlayerError>;
    /// 继续从已绑定的帧源拉取；没有绑定、已关闭或帧源已耗尽时失败
    fn resume(&mut self) -> Result<(), PlayerError>;
    /// 暂停回调，保留已绑定的帧源
    fn stop(&mut self);
    /// 释放底层音频句柄，可重复调用
    fn close(&mut self);
}

/// 输出后端
pub trait AudioBackend: Send + Sync {
    fn open_device(
        &self,
        sample_rate: u32,
        channel_count: u16,
        volume: SharedVolume,
    ) -> Result<Box<dyn PlaybackDevice>, PlayerError>;
}

/// 音频输出配置
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// 每次从帧源拉取的帧数
    pub period_frames: usize,
    /// 回调前的缓冲块数
    pub queue_depth: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            period_frames: 1024,
            queue_depth: 8,
        }
    }
}

/// cpal 输出后端
#[derive(Debug, Clone)]
pub struct CpalBackend {
    period_frames: usize,
    queue_depth: usize,
}

impl CpalBackend {
    pub fn new(period_frames: usize, queue_depth: usize) -> Self {
        Self {
            period_frames: period_frames.max(1),
            queue_depth: queue_depth.max(1),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        let config = OutputConfig::default();
        Self::new(config.period_frames, config.queue_depth)
    }
}

impl AudioBackend for CpalBackend {
    fn open_device(
        &self,
        sample_rate: u32,
        channel_count: u16,
        volume: SharedVolume,
    ) -> Result<Box<dyn PlaybackDevice>, PlayerError> {
        let config = OutputConfig {
            sample_rate,
            channels: channel_count,
            period_frames: self.period_frames,
            queue_depth: self.queue_depth,
        };
        Ok(Box::new(CpalDevice::open(config, volume)?))
    }
}

/// 设备线程对启动/恢复命令的应答
type Reply = Sender<Result<(), PlayerError>>;

enum DeviceCommand {
    Start(PcmFrameSource, Reply),
    Resume(Reply),
    Stop,
    Close,
}

/// cpal 输出设备句柄
pub struct CpalDevice {
    cmd_tx: Sender<DeviceCommand>,
    drained: Arc<AtomicBool>,
    bound: bool,
    closed: bool,
}

impl CpalDevice {
    /// 在设备线程上打开默认输出设备，等待其就绪
    pub fn open(config: OutputConfig, volume: SharedVolume) -> Result<Self, PlayerError> {
        let (cmd_tx, cmd_rx) = bounded(8);
        let (ready_tx, ready_rx) = bounded(1);
        let drained = Arc::new(AtomicBool::new(false));
        let drained_clone = drained.clone();

        thread::spawn(move || {
            run_device(config, volume, drained_clone, cmd_rx, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                drained,
                bound: false,
                closed: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PlayerError::DeviceOpenFailure(
                "device thread exited before opening".into(),
            )),
        }
    }

    fn send(&self, cmd: DeviceCommand) -> Result<(), PlayerError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| PlayerError::DeviceOpenFailure("device thread is gone".into()))
    }

    /// 发送命令并等待设备线程确认 stream 已开始播放
    fn request(&self, cmd: impl FnOnce(Reply) -> DeviceCommand) -> Result<(), PlayerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(cmd(reply_tx))?;
        reply_rx.recv().unwrap_or_else(|_| {
            Err(PlayerError::DeviceOpenFailure(
                "device thread exited without replying".into(),
            ))
        })
    }
}

impl PlaybackDevice for CpalDevice {
    fn start(&mut self, source: PcmFrameSource) -> Result<(), PlayerError> {
        if self.closed {
            return Err(PlayerError::DeviceOpenFailure("device is closed".into()));
        }
        if self.bound {
            return Err(PlayerError::DeviceOpenFailure(
                "device already has a frame source".into(),
            ));
        }
        self.request(|reply| DeviceCommand::Start(source, reply))?;
        self.bound = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlayerError> {
        if self.closed || !self.bound {
            return Err(PlayerError::DeviceOpenFailure("no frame source bound".into()));
        }
        if self.drained.load(Ordering::Acquire) {
            return Err(PlayerError::DeviceOpenFailure("frame source exhausted".into()));
        }
        self.request(DeviceCommand::Resume)
    }

    fn stop(&mut self) {
        if !self.closed {
            let _ = self.send(DeviceCommand::Stop);
        }
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            let _ = self.send(DeviceCommand::Close);
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_device(
    config: OutputConfig,
    volume: SharedVolume,
    drained: Arc<AtomicBool>,
    cmd_rx: Receiver<DeviceCommand>,
    ready_tx: Sender<Result<(), PlayerError>>,
) {
    let (sample_tx, sample_rx) = bounded::<Vec<i16>>(config.queue_depth);

    let stream = match build_stream(&config, sample_rx, volume) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    serve_commands(&stream, config.period_frames, sample_tx, drained, cmd_rx);
    // stream 在这里释放，采样通道随之关闭，pump 线程在下一次发送时退出
}

/// 设备线程需要的 stream 控制操作
trait StreamControl {
    fn start_output(&self) -> Result<(), PlayerError>;
    fn pause_output(&self) -> Result<(), PlayerError>;
}

impl StreamControl for Stream {
    fn start_output(&self) -> Result<(), PlayerError> {
        self.play().map_err(|e| PlayerError::DeviceOpenFailure(e.to_string()))
    }

    fn pause_output(&self) -> Result<(), PlayerError> {
        self.pause().map_err(|e| PlayerError::DeviceOpenFailure(e.to_string()))
    }
}

fn serve_commands<S: StreamControl>(
    stream: &S,
    period_frames: usize,
    sample_tx: Sender<Vec<i16>>,
    drained: Arc<AtomicBool>,
    cmd_rx: Receiver<DeviceCommand>,
) {
    let mut sample_tx = Some(sample_tx);

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            DeviceCommand::Start(source, reply) => {
                let result = stream.start_output();
                match (&result, sample_tx.take()) {
                    (Ok(()), Some(tx)) => {
                        let drained = drained.clone();
                        thread::spawn(move || pump(source, period_frames, tx, drained));
                    }
                    (Err(e), _) => log::error!("Failed to start output stream: {}", e),
                    (Ok(()), None) => log::warn!("Output stream already has a frame source"),
                }
                let _ = reply.send(result);
            }
            DeviceCommand::Resume(reply) => {
                let result = stream.start_output();
                if let Err(e) = &result {
                    log::error!("Failed to resume output stream: {}", e);
                }
                let _ = reply.send(result);
            }
            DeviceCommand::Stop => {
                if let Err(e) = stream.pause_output() {
                    log::warn!("Failed to pause output stream: {}", e);
                }
            }
            DeviceCommand::Close => break,
        }
    }
}

/// 按周期从帧源拉取 s16le 数据并送入回调队列
fn pump(source: PcmFrameSource, period_frames: usize, tx: Sender<Vec<i16>>, drained: Arc<AtomicBool>) {
    for chunk in source.chunks(period_frames) {
        let samples: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if tx.send(samples).is_err() {
            return;
        }
    }
    drained.store(true, Ordering::Release);
}

fn build_stream(
    config: &OutputConfig,
    sample_rx: Receiver<Vec<i16>>,
    volume: SharedVolume,
) -> Result<Stream, PlayerError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::DeviceOpenFailure("no output device available".into()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| PlayerError::DeviceOpenFailure(e.to_string()))?
        .filter(|c| {
            c.channels() == config.channels
                && c.min_sample_rate().0 <= config.sample_rate
                && c.max_sample_rate().0 >= config.sample_rate
        })
        .filter_map(|c| format_rank(c.sample_format()).map(|rank| (rank, c)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, c)| c)
        .ok_or_else(|| {
            PlayerError::DeviceOpenFailure(format!(
                "no output config for {} Hz / {} channels",
                config.sample_rate, config.channels
            ))
        })?;

    let sample_format = supported_config.sample_format();
    let stream_config: StreamConfig = supported_config
        .with_sample_rate(cpal::SampleRate(config.sample_rate))
        .into();

    let feeder = CallbackFeeder::new(sample_rx, volume);
    let stream = match sample_format {
        SampleFormat::I16 => build_typed::<i16>(&device, &stream_config, feeder),
        _ => build_typed::<f32>(&device, &stream_config, feeder),
    }?;

    // 创建后先保持暂停，等待绑定帧源
    let _ = stream.pause();
    Ok(stream)
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        _ => None,
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut feeder: CallbackFeeder,
) -> Result<Stream, PlayerError>
where
    T: SizedSample + FromSample<f32> + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| feeder.fill(data),
            |err| {
                log::error!("Audio output error: {}", err);
            },
            None,
        )
        .map_err(|e| PlayerError::DeviceOpenFailure(e.to_string()))
}

/// 音频回调侧：只做非阻塞的 `try_recv`，欠载时输出静音
struct CallbackFeeder {
    rx: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    cursor: usize,
    volume: SharedVolume,
}

impl CallbackFeeder {
    fn new(rx: Receiver<Vec<i16>>, volume: SharedVolume) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            cursor: 0,
            volume,
        }
    }

    fn next_sample(&mut self) -> Option<i16> {
        while self.cursor >= self.pending.len() {
            match self.rx.try_recv() {
                Ok(next) => {
                    self.pending = next;
                    self.cursor = 0;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
        let sample = self.pending[self.cursor];
        self.cursor += 1;
        Some(sample)
    }

    fn fill<T: Sample + FromSample<f32>>(&mut self, data: &mut [T]) {
        let gain = self.volume.get();
        for slot in data.iter_mut() {
            *slot = match self.next_sample() {
                Some(s) => T::from_sample(s as f32 / 32768.0 * gain),
                None => T::EQUILIBRIUM,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_volume_clamps() {
        let volume = SharedVolume::new(3.0);
        assert_eq!(volume.get(), 1.0);

        volume.set(-0.3);
        assert_eq!(volume.get(), 0.0);

        volume.set(0.42);
        assert_eq!(volume.get(), 0.42);

        let other = volume.clone();
        other.set(f32::NAN);
        assert_eq!(volume.get(), 0.0);
    }

    #[test]
    fn test_feeder_applies_gain_and_pads_silence() {
        let (tx, rx) = bounded(4);
        let mut feeder = CallbackFeeder::new(rx, SharedVolume::new(0.5));
        tx.send(vec![16384, -16384]).unwrap();
        tx.send(vec![]).unwrap();
        tx.send(vec![32767]).unwrap();

        let mut out = [1.0f32; 5];
        feeder.fill(&mut out);

        assert_eq!(out[0], 0.25);
        assert_eq!(out[1], -0.25);
        assert!((out[2] - 0.5).abs() < 1e-4);
        assert_eq!(&out[3..], &[0.0, 0.0]);
    }

    #[test]
    fn test_feeder_keeps_partial_buffer_between_callbacks() {
        let (tx, rx) = bounded(4);
        let mut feeder = CallbackFeeder::new(rx, SharedVolume::new(1.0));
        tx.send(vec![100, 200, 300]).unwrap();

        let mut first = [0i16; 2];
        feeder.fill(&mut first);
        let mut second = [7i16; 2];
        feeder.fill(&mut second);

        assert_eq!(first, [100, 200]);
        assert_eq!(second, [300, 0]);
    }

    #[test]
    fn test_pump_marks_drained_at_end_of_stream() {
        let bytes: Vec<u8> = [1i16, -2, 3, -4, 5, -6]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let source = PcmFrameSource::new(
            Box::new(std::io::Cursor::new(bytes)) as crate::PcmStream,
            2,
            2,
        );
        let (tx, rx) = bounded(8);
        let drained = Arc::new(AtomicBool::new(false));

        pump(source, 2, tx, drained.clone());

        let received: Vec<Vec<i16>> = rx.try_iter().collect();
        assert_eq!(received, vec![vec![1, -2, 3, -4], vec![5, -6]]);
        assert!(drained.load(Ordering::Acquire));
    }

    struct ScriptedStream {
        fail_play: bool,
        plays: AtomicU32,
    }

    impl StreamControl for ScriptedStream {
        fn start_output(&self) -> Result<(), PlayerError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            if self.fail_play {
                Err(PlayerError::DeviceOpenFailure("stream refused to start".into()))
            } else {
                Ok(())
            }
        }

        fn pause_output(&self) -> Result<(), PlayerError> {
            Ok(())
        }
    }

    fn scripted_device(fail_play: bool) -> (CpalDevice, thread::JoinHandle<u32>) {
        let (cmd_tx, cmd_rx) = bounded(8);
        let (sample_tx, _sample_rx) = bounded::<Vec<i16>>(1);
        let drained = Arc::new(AtomicBool::new(false));
        let pump_drained = drained.clone();
        let worker = thread::spawn(move || {
            let stream = ScriptedStream {
                fail_play,
                plays: AtomicU32::new(0),
            };
            serve_commands(&stream, 16, sample_tx, pump_drained, cmd_rx);
            stream.plays.load(Ordering::SeqCst)
        });
        let device = CpalDevice {
            cmd_tx,
            drained,
            bound: false,
            closed: false,
        };
        (device, worker)
    }

    fn silent_source() -> PcmFrameSource {
        PcmFrameSource::new(Box::new(std::io::repeat(0)) as crate::PcmStream, 2, 2)
    }

    #[test]
    fn test_start_reports_stream_failure() {
        let (mut device, worker) = scripted_device(true);

        let err = device.start(silent_source()).unwrap_err();
        assert!(matches!(err, PlayerError::DeviceOpenFailure(_)));
        assert!(device.resume().is_err());

        device.close();
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn test_start_and_resume_wait_for_stream() {
        let (mut device, worker) = scripted_device(false);

        device.start(silent_source()).unwrap();
        device.stop();
        device.resume().unwrap();
        assert!(device.start(silent_source()).is_err());

        device.close();
        assert_eq!(worker.join().unwrap(), 2);
    }
}
