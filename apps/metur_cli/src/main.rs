//! metur-cli - 命令行播放器
//!
//! 播放一个文件，在终端显示进度，并从标准输入读取控制命令。

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use env_logger::Env;
use metur_player::{Player, PlayerCommand, PlayerConfig};

const COMMANDS_HELP: &str = "\
Commands:
  p              toggle play/pause
  play | pause   explicit transport
  s              stop
  seek <secs>    jump to position (whole seconds are decoded)
  + | -          volume up/down by 0.1
  vol <0..1>     set volume
  loop on|off    toggle looping
  load <path>    play another file
  q              quit";

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage:");
        eprintln!(
            "  {} <audio file> [--loop] [--volume <0..1>] [--config <file.json>] [--ffmpeg <path>]",
            args[0]
        );
        std::process::exit(1);
    }

    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    let media = options.media;

    let mut config = match options.config_path {
        Some(path) => match PlayerConfig::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => PlayerConfig::default(),
    };
    if let Some(program) = options.ffmpeg {
        config.decoder_program = program;
    }
    if let Some(v) = options.volume {
        config.initial_volume = v;
    }
    config.loop_enabled |= options.looping;

    let player = Player::new(config);
    player.set_media(&media);

    let monitor = {
        let player = player.clone();
        thread::spawn(move || {
            player.thread_play(|duration, position| {
                let percent = if duration == 0 {
                    0.0
                } else {
                    position as f64 / duration as f64 * 100.0
                };
                print!(
                    "\r{} / {} ({:5.1}%) ",
                    format_time(position),
                    format_time(duration),
                    percent
                );
                let _ = io::stdout().flush();
            });
        })
    };

    println!("Playing {}", media.display());
    println!("{}", COMMANDS_HELP);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line, player.get_volume()) {
            Some(cmd) => {
                if !player.dispatch(cmd) {
                    break;
                }
            }
            None => eprintln!("Unknown command: {}", line.trim()),
        }
    }

    player.signal_stop();
    if monitor.join().is_err() {
        log::error!("Position monitor panicked");
    }
    println!();
}

/// 命令行选项
#[derive(Debug, PartialEq)]
struct CliOptions {
    media: PathBuf,
    config_path: Option<PathBuf>,
    volume: Option<f32>,
    ffmpeg: Option<PathBuf>,
    looping: bool,
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut media: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut volume: Option<f32> = None;
    let mut ffmpeg: Option<PathBuf> = None;
    let mut looping = false;

    let mut rest = args.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--loop" => looping = true,
            "--volume" => match rest.next().map(|v| v.parse::<f32>()) {
                Some(Ok(v)) => volume = Some(v),
                _ => return Err("--volume needs a number between 0 and 1".into()),
            },
            "--config" => config_path = rest.next().map(PathBuf::from),
            "--ffmpeg" => ffmpeg = rest.next().map(PathBuf::from),
            other if other.starts_with("--") => return Err(format!("Unknown option: {}", other)),
            other => media = Some(PathBuf::from(other)),
        }
    }

    let media = media.ok_or_else(|| "No audio file given".to_string())?;
    Ok(CliOptions {
        media,
        config_path,
        volume,
        ffmpeg,
        looping,
    })
}

/// 把一行输入解析为播放命令
fn parse_command(line: &str, current_volume: f32) -> Option<PlayerCommand> {
    let mut words = line.split_whitespace();
    let cmd = match (words.next()?, words.next()) {
        ("p", None) => PlayerCommand::Toggle,
        ("play", None) => PlayerCommand::Play,
        ("pause", None) => PlayerCommand::Pause,
        ("s" | "stop", None) => PlayerCommand::Stop,
        ("q" | "quit", None) => PlayerCommand::Shutdown,
        ("+", None) => PlayerCommand::SetVolume(current_volume + 0.1),
        ("-", None) => PlayerCommand::SetVolume(current_volume - 0.1),
        ("vol", Some(v)) => PlayerCommand::SetVolume(v.parse().ok()?),
        ("seek", Some(secs)) => {
            let secs: f64 = secs.parse().ok()?;
            if secs < 0.0 {
                return None;
            }
            PlayerCommand::Seek((secs * 1000.0) as u64)
        }
        ("loop", Some("on")) => PlayerCommand::SetLoop(true),
        ("loop", Some("off")) => PlayerCommand::SetLoop(false),
        ("load", Some(_)) => {
            let path = line.trim_start().strip_prefix("load")?.trim();
            PlayerCommand::Load(PathBuf::from(path))
        }
        _ => return None,
    };
    Some(cmd)
}

/// mm:ss，超过一小时时为 h:mm:ss
fn format_time(ms: u64) -> String {
    let total = ms / 1000;
    let (h, m, s) = (total / 3600, total / 60 % 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
