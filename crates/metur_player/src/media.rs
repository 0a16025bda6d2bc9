//! 媒体探测
//!
//! 使用 symphonia 读取容器/音轨元数据，不做完整解码。

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use crate::PlayerError;

/// 解码管线输出的采样宽度（s16le）
pub const PCM_SAMPLE_WIDTH: u16 = 2;

const FALLBACK_SAMPLE_RATE: u32 = 44100;
const FALLBACK_CHANNELS: u16 = 2;

/// 已探测的媒体信息，加载后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub path: PathBuf,
    /// 总时长，未知时为 0
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub sample_width_bytes: u16,
}

/// 媒体探测后端
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaHandle, PlayerError>;
}

/// 基于 symphonia 的探测器
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProbe;

impl MediaProbe for SymphoniaProbe {
    fn probe(&self, path: &Path) -> Result<MediaHandle, PlayerError> {
        let file = File::open(path).map_err(|e| PlayerError::unreadable(path, e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| PlayerError::unreadable(path, e))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlayerError::unreadable(path, "no audio track"))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params.sample_rate.unwrap_or_else(|| {
            log::debug!("{}: no sample rate in header, assuming {}", path.display(), FALLBACK_SAMPLE_RATE);
            FALLBACK_SAMPLE_RATE
        });
        let channel_count = params
            .channels
            .map(|c| c.count() as u16)
            .filter(|&c| c > 0)
            .unwrap_or(FALLBACK_CHANNELS);

        let time_base = params.time_base;
        let duration_ms = match params.n_frames {
            Some(frames) => ticks_to_ms(frames, time_base, sample_rate),
            None => {
                // 容器没有记录帧数（如无 Xing 头的 MP3），只解复用不解码
                let ticks = sum_packet_durations(format.as_mut(), track_id);
                ticks_to_ms(ticks, time_base, sample_rate)
            }
        };

        Ok(MediaHandle {
            path: path.to_path_buf(),
            duration_ms,
            sample_rate,
            channel_count,
            sample_width_bytes: PCM_SAMPLE_WIDTH,
        })
    }
}

fn sum_packet_durations(format: &mut dyn FormatReader, track_id: u32) -> u64 {
    let mut total = 0u64;
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() == track_id {
            total += packet.dur;
        }
    }
    total
}

fn ticks_to_ms(ticks: u64, time_base: Option<TimeBase>, sample_rate: u32) -> u64 {
    match time_base {
        Some(tb) => {
            let time = tb.calc_time(ticks);
            time.seconds * 1000 + (time.frac * 1000.0) as u64
        }
        None if sample_rate > 0 => ticks * 1000 / sample_rate as u64,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as u32 {
            writer.write_sample((i % 64) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_probe_wav_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 44100, 2, 22050);

        let media = SymphoniaProbe.probe(&path).unwrap();

        assert_eq!(media.path, path);
        assert_eq!(media.duration_ms, 500);
        assert_eq!(media.sample_rate, 44100);
        assert_eq!(media.channel_count, 2);
        assert_eq!(media.sample_width_bytes, PCM_SAMPLE_WIDTH);
    }

    #[test]
    fn test_probe_mono_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, 8000, 1, 16000);

        let media = SymphoniaProbe.probe(&path).unwrap();
        assert_eq!(media.duration_ms, 2000);
        assert_eq!(media.channel_count, 1);
    }

    #[test]
    fn test_probe_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SymphoniaProbe.probe(&dir.path().join("nope.mp3")).unwrap_err();
        assert!(matches!(err, PlayerError::MediaUnreadable { .. }));
    }

    #[test]
    fn test_probe_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"this is not audio at all".repeat(32)).unwrap();

        let err = SymphoniaProbe.probe(&path).unwrap_err();
        assert!(matches!(err, PlayerError::MediaUnreadable { .. }));
    }

    #[test]
    fn test_ticks_to_ms_without_time_base() {
        assert_eq!(ticks_to_ms(48000, None, 48000), 1000);
        assert_eq!(ticks_to_ms(100, None, 0), 0);
    }
}
