//! 播放引擎
//!
//! `Player` 是对 UI 暴露的传输状态机。会话状态由一把互斥锁保护，
//! 解码进程的启动/终止和设备的打开/关闭都在锁外完成；后台加载线程
//! 只有在其代数（generation）仍是最新时才发布结果。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::tick;
use parking_lot::Mutex;

use crate::{
    AudioBackend, CpalBackend, DecodeRequest, DecoderHandle, FfmpegDecoder, MediaHandle,
    MediaProbe, PcmDecoder, PcmFrameSource, PlaybackDevice, PlaybackState, PlayerCommand,
    PlayerConfig, PlayerError, PositionClock, SharedVolume, SymphoniaProbe,
};

/// 播放器句柄，克隆后共享同一个会话
#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
}

/// 一次查询得到的一致快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub duration_ms: u64,
    pub position_ms: u64,
}

impl PlaybackStatus {
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// 播放进度百分比，时长未知时为 0
    pub fn progress(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.position_ms as f64 / self.duration_ms as f64 * 100.0
    }
}

struct Shared {
    session: Mutex<PlaybackSession>,
    probe: Arc<dyn MediaProbe>,
    decoder: Arc<dyn PcmDecoder>,
    audio: Arc<dyn AudioBackend>,
    volume: SharedVolume,
    stop_signal: AtomicBool,
    config: PlayerConfig,
}

struct PlaybackSession {
    media: Option<MediaHandle>,
    state: PlaybackState,
    clock: PositionClock,
    volume: f32,
    loop_enabled: bool,
    decoder: Option<DecoderHandle>,
    device: Option<Box<dyn PlaybackDevice>>,
    generation: u64,
}

impl PlaybackSession {
    /// 使所有进行中的加载失效
    fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn retire(&mut self) -> Retired {
        Retired {
            decoder: self.decoder.take(),
            device: self.device.take(),
        }
    }

    fn position_ms(&self, now: Instant) -> u64 {
        self.clock.elapsed_ms(self.state, now)
    }

    fn duration_ms(&self) -> u64 {
        self.media.as_ref().map_or(0, |m| m.duration_ms)
    }
}

/// 从会话中摘下、等待在锁外释放的资源
#[must_use]
struct Retired {
    decoder: Option<DecoderHandle>,
    device: Option<Box<dyn PlaybackDevice>>,
}

impl Retired {
    fn release(mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            device.close();
        }
        if let Some(mut decoder) = self.decoder.take() {
            decoder.terminate();
        }
    }
}

enum LoadPlan {
    /// 探测并从头播放
    Open(PathBuf),
    /// 已探测的媒体在新位置重启解码
    Restart { media: MediaHandle, position_ms: u64 },
}

impl Player {
    /// 使用 symphonia / ffmpeg / cpal 后端
    pub fn new(config: PlayerConfig) -> Self {
        let decoder = FfmpegDecoder::new(config.decoder_program.clone());
        let audio = CpalBackend::new(config.period_frames, config.queue_depth);
        Self::with_backends(
            config,
            Arc::new(SymphoniaProbe),
            Arc::new(decoder),
            Arc::new(audio),
        )
    }

    pub fn with_backends(
        config: PlayerConfig,
        probe: Arc<dyn MediaProbe>,
        decoder: Arc<dyn PcmDecoder>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        let volume = SharedVolume::new(config.initial_volume);
        let session = PlaybackSession {
            media: None,
            state: PlaybackState::Stopped,
            clock: PositionClock::new(Instant::now()),
            volume: volume.get(),
            loop_enabled: config.loop_enabled,
            decoder: None,
            device: None,
            generation: 0,
        };

        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                probe,
                decoder,
                audio,
                volume,
                stop_signal: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// 加载并播放文件，不阻塞调用线程
    ///
    /// 返回后台加载线程的句柄，可以忽略。被更新的 `set_media` 取代的加载
    /// 会丢弃自己的结果并释放它创建的资源。
    pub fn set_media(&self, path: impl Into<PathBuf>) -> JoinHandle<()> {
        let path = path.into();
        let (generation, retired) = {
            let mut session = self.shared.session.lock();
            let generation = session.advance_generation();
            let retired = session.retire();
            session.media = None;
            session.state = PlaybackState::Stopped;
            session.clock.reset();
            (generation, retired)
        };

        log::info!("Loading {}", path.display());
        self.shared.spawn_load(generation, LoadPlan::Open(path), retired)
    }

    /// 播放或从暂停恢复
    ///
    /// 需要重启解码器时返回后台任务句柄。
    pub fn play(&self) -> Option<JoinHandle<()>> {
        let mut session = self.shared.session.lock();
        let now = Instant::now();

        let state = session.state;
        let position_ms = match state {
            PlaybackState::Playing => return None,
            PlaybackState::Paused => {
                let decoder_alive = session.decoder.as_mut().is_some_and(|d| d.is_alive());
                let resumed = decoder_alive
                    && match session.device.as_mut() {
                        Some(device) => match device.resume() {
                            Ok(()) => true,
                            Err(e) => {
                                log::debug!("Cannot resume device, restarting decoder: {}", e);
                                false
                            }
                        },
                        None => false,
                    };
                if resumed {
                    session.clock.resume(now);
                    session.state = PlaybackState::Playing;
                    return None;
                }
                session.position_ms(now)
            }
            PlaybackState::Stopped => {
                session.clock.reset();
                0
            }
        };

        let Some(media) = session.media.clone() else {
            log::debug!("play() ignored, no media loaded");
            return None;
        };
        let generation = session.advance_generation();
        let retired = session.retire();
        drop(session);

        Some(self.shared.spawn_load(
            generation,
            LoadPlan::Restart { media, position_ms },
            retired,
        ))
    }

    /// 暂停：冻结位置并停止设备回调，解码进程保持存活
    pub fn pause(&self) {
        let mut session = self.shared.session.lock();
        if session.state != PlaybackState::Playing {
            return;
        }
        // 进行中的重启（跳转/循环）不应在暂停后再开始播放
        session.advance_generation();
        session.clock.pause(Instant::now());
        if let Some(device) = session.device.as_mut() {
            device.stop();
        }
        session.state = PlaybackState::Paused;
    }

    /// 在播放和暂停之间切换
    pub fn resume_pause(&self) -> Option<JoinHandle<()>> {
        if self.state() == PlaybackState::Playing {
            self.pause();
            None
        } else {
            self.play()
        }
    }

    /// 停止并释放解码进程和输出设备，位置归零，可重复调用
    pub fn stop(&self) {
        let retired = {
            let mut session = self.shared.session.lock();
            session.advance_generation();
            session.state = PlaybackState::Stopped;
            session.clock.reset();
            session.retire()
        };
        retired.release();
    }

    /// 近似跳转：解码器在整秒偏移处重启，时钟报告请求的毫秒位置
    ///
    /// 暂停时只记录新位置，恢复播放时再重启解码器。
    pub fn seek(&self, target_ms: u64) -> Option<JoinHandle<()>> {
        let mut session = self.shared.session.lock();
        let Some(media) = session.media.clone() else {
            log::debug!("seek() ignored, no media loaded");
            return None;
        };
        let target_ms = if media.duration_ms > 0 {
            target_ms.min(media.duration_ms)
        } else {
            target_ms
        };

        let now = Instant::now();
        let generation = session.advance_generation();
        let retired = session.retire();

        let state = session.state;
        match state {
            PlaybackState::Paused => {
                session.clock.start_at(now, target_ms);
                session.clock.pause(now);
                drop(session);
                retired.release();
                None
            }
            PlaybackState::Playing | PlaybackState::Stopped => {
                if state == PlaybackState::Playing {
                    session.clock.start_at(now, target_ms);
                } else {
                    session.clock.freeze(target_ms);
                }
                drop(session);
                Some(self.shared.spawn_load(
                    generation,
                    LoadPlan::Restart {
                        media,
                        position_ms: target_ms,
                    },
                    retired,
                ))
            }
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if volume.is_nan() {
            log::warn!("Ignoring NaN volume");
            return;
        }
        let mut session = self.shared.session.lock();
        session.volume = volume.clamp(0.0, 1.0);
        self.shared.volume.set(session.volume);
    }

    pub fn get_volume(&self) -> f32 {
        self.shared.session.lock().volume
    }

    pub fn set_loop(&self, enabled: bool) {
        self.shared.session.lock().loop_enabled = enabled;
    }

    pub fn get_loop(&self) -> bool {
        self.shared.session.lock().loop_enabled
    }

    /// 当前播放位置（毫秒）
    pub fn get_play_position_ms(&self) -> u64 {
        self.status().position_ms
    }

    pub fn get_duration_ms(&self) -> u64 {
        self.shared.session.lock().duration_ms()
    }

    pub fn get_progress(&self) -> f64 {
        self.status().progress()
    }

    /// 正在播放且未到结尾
    ///
    /// 不循环时，位置到达时长会把会话切到 `Stopped` 并释放资源；
    /// 循环时会从头重启解码器。
    pub fn is_playing(&self) -> bool {
        self.status().is_playing()
    }

    pub fn state(&self) -> PlaybackState {
        self.status().state
    }

    pub fn current_media(&self) -> Option<MediaHandle> {
        self.shared.session.lock().media.clone()
    }

    /// 一次加锁读取状态、时长和位置，同时处理播放结束
    pub fn status(&self) -> PlaybackStatus {
        let now = Instant::now();
        let (status, finished) = {
            let mut session = self.shared.session.lock();
            let finished = self.shared.check_end(&mut session, now);
            let status = PlaybackStatus {
                state: session.state,
                duration_ms: session.duration_ms(),
                position_ms: session.position_ms(now),
            };
            (status, finished)
        };
        if let Some(retired) = finished {
            retired.release();
        }
        status
    }

    /// 位置轮询循环，直到 [`Player::signal_stop`] 被调用
    ///
    /// 播放中每个轮询周期调用一次 `update_position(duration_ms, position_ms)`，
    /// 退出前执行 [`Player::stop`]。
    pub fn thread_play<F>(&self, mut update_position: F)
    where
        F: FnMut(u64, u64),
    {
        let ticker = tick(self.shared.config.poll_interval());
        while !self.shared.stop_signal.load(Ordering::Acquire) {
            let status = self.status();
            if status.is_playing() {
                update_position(status.duration_ms, status.position_ms);
            }
            let _ = ticker.recv();
        }
        self.stop();
    }

    pub fn signal_stop(&self) {
        self.shared.stop_signal.store(true, Ordering::Release);
    }

    /// 执行一条命令，`Shutdown` 返回 false
    pub fn dispatch(&self, cmd: PlayerCommand) -> bool {
        match cmd {
            PlayerCommand::Load(path) => {
                self.set_media(path);
            }
            PlayerCommand::Play => {
                self.play();
            }
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Toggle => {
                self.resume_pause();
            }
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::Seek(ms) => {
                self.seek(ms);
            }
            PlayerCommand::SetVolume(vol) => self.set_volume(vol),
            PlayerCommand::SetLoop(enabled) => self.set_loop(enabled),
            PlayerCommand::Shutdown => {
                self.signal_stop();
                return false;
            }
        }
        true
    }
}

impl Shared {
    fn spawn_load(self: &Arc<Self>, generation: u64, plan: LoadPlan, retired: Retired) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        thread::spawn(move || {
            retired.release();
            shared.run_load(generation, plan);
        })
    }

    fn run_load(&self, generation: u64, plan: LoadPlan) {
        let (media, position_ms) = match plan {
            LoadPlan::Open(path) => match self.probe.probe(&path) {
                Ok(media) => (media, 0),
                Err(e) => {
                    log::warn!("{}", e);
                    self.abandon(generation);
                    return;
                }
            },
            LoadPlan::Restart { media, position_ms } => (media, position_ms),
        };

        if self.is_stale(generation) {
            log::debug!("Load of {} superseded before decoding", media.path.display());
            return;
        }

        match self.start_pipeline(&media, position_ms) {
            Ok((decoder, device)) => self.publish(generation, media, position_ms, decoder, device),
            Err(e) => {
                log::error!("Failed to start playback of {}: {}", media.path.display(), e);
                self.abandon(generation);
            }
        }
    }

    fn start_pipeline(
        &self,
        media: &MediaHandle,
        position_ms: u64,
    ) -> Result<(DecoderHandle, Box<dyn PlaybackDevice>), PlayerError> {
        let mut decoder = self.decoder.start(&DecodeRequest::for_media(media, position_ms))?;
        let output = decoder.take_output().ok_or_else(|| {
            PlayerError::DecodeSpawnFailure("decoder has no output stream".into())
        })?;
        let mut source = PcmFrameSource::new(output, media.channel_count, media.sample_width_bytes);
        if !source.wait_for_audio() {
            let status = if decoder.is_alive() { "closed its output" } else { "exited" };
            return Err(PlayerError::DecodeSpawnFailure(format!(
                "decoder {} without producing audio at {} ms",
                status, position_ms
            )));
        }

        // 失败时 decoder 在 drop 中终止
        let mut device =
            self.audio
                .open_device(media.sample_rate, media.channel_count, self.volume.clone())?;
        if let Err(e) = device.start(source) {
            device.close();
            return Err(e);
        }
        Ok((decoder, device))
    }

    fn publish(
        &self,
        generation: u64,
        media: MediaHandle,
        position_ms: u64,
        decoder: DecoderHandle,
        device: Box<dyn PlaybackDevice>,
    ) {
        let mut session = self.session.lock();
        if session.generation != generation {
            drop(session);
            log::debug!("Discarding superseded load of {}", media.path.display());
            Retired {
                decoder: Some(decoder),
                device: Some(device),
            }
            .release();
            return;
        }

        let previous = session.retire();
        log::info!(
            "Playing {} from {} ms ({} ms total)",
            media.path.display(),
            position_ms,
            media.duration_ms
        );
        session.media = Some(media);
        session.decoder = Some(decoder);
        session.device = Some(device);
        session.clock.start_at(Instant::now(), position_ms);
        session.state = PlaybackState::Playing;
        drop(session);

        previous.release();
    }

    /// 当前代数的加载失败：回到 `Stopped`
    fn abandon(&self, generation: u64) {
        let retired = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.state = PlaybackState::Stopped;
            session.clock.reset();
            session.retire()
        };
        retired.release();
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.session.lock().generation != generation
    }

    /// 播放到结尾时循环或结束；返回需要在锁外释放的资源
    fn check_end(self: &Arc<Self>, session: &mut PlaybackSession, now: Instant) -> Option<Retired> {
        if session.state != PlaybackState::Playing {
            return None;
        }
        let duration_ms = session.duration_ms();
        if duration_ms == 0 || session.position_ms(now) < duration_ms {
            return None;
        }
        let media = session.media.clone()?;

        let generation = session.advance_generation();
        let retired = session.retire();

        if session.loop_enabled {
            log::debug!("Looping {}", media.path.display());
            session.clock.start_at(now, 0);
            self.spawn_load(
                generation,
                LoadPlan::Restart {
                    media,
                    position_ms: 0,
                },
                retired,
            );
            None
        } else {
            log::info!("Playback finished after {} ms", duration_ms);
            session.state = PlaybackState::Stopped;
            session.clock.freeze(duration_ms);
            Some(retired)
        }
    }
}
