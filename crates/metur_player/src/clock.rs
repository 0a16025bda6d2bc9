//! 播放位置时钟
//!
//! 只依赖挂钟参考点计算已播放时间，不向解码器或设备查询。

use std::time::{Duration, Instant};

use crate::PlaybackState;

/// 基于挂钟的位置时钟
///
/// `offset_ms` 是当前这一段播放的起点（跳转/重启时的位置），
/// 暂停期间的时长通过推进 `start_ref` 排除。
#[derive(Debug, Clone)]
pub struct PositionClock {
    start_ref: Instant,
    pause_ref: Instant,
    offset_ms: u64,
    cached_ms: u64,
}

impl PositionClock {
    pub fn new(now: Instant) -> Self {
        Self {
            start_ref: now,
            pause_ref: now,
            offset_ms: 0,
            cached_ms: 0,
        }
    }

    /// 从 `position_ms` 处开始计时
    pub fn start_at(&mut self, now: Instant, position_ms: u64) {
        self.start_ref = now;
        self.pause_ref = now;
        self.offset_ms = position_ms;
        self.cached_ms = position_ms;
    }

    /// 记录暂停时刻，暂停期间的位置冻结在此刻
    pub fn pause(&mut self, now: Instant) {
        self.pause_ref = now.max(self.start_ref);
        self.cached_ms = self.offset_ms + millis(self.pause_ref - self.start_ref);
    }

    /// 从暂停恢复：起点后移暂停的时长
    pub fn resume(&mut self, now: Instant) {
        self.start_ref += now.saturating_duration_since(self.pause_ref);
    }

    /// 停止状态下报告的位置
    pub fn freeze(&mut self, position_ms: u64) {
        self.offset_ms = position_ms;
        self.cached_ms = position_ms;
    }

    pub fn reset(&mut self) {
        self.freeze(0);
    }

    pub fn elapsed_ms(&self, state: PlaybackState, now: Instant) -> u64 {
        match state {
            PlaybackState::Paused => self.offset_ms + millis(self.pause_ref - self.start_ref),
            PlaybackState::Playing => {
                self.offset_ms + millis(now.saturating_duration_since(self.start_ref))
            }
            PlaybackState::Stopped => self.cached_ms,
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
