//! tact CLI: runs a demo voice graph live or renders it to WAV.
//!
//! Usage:
//!   tact-cli [key=value ...] [--config sound.yaml] [--voices N] [--ticks N] [--wav output.wav]
//!
//! Keys: samplerate, buffer-size, pcm-channels, format, thread-model,
//! super-threaded-scope. Key/value pairs take precedence over the file.

use std::time::Duration;
use std::{env, fs};
use tact_engine::{create_recall, Attachment, EngineGraph, RecallUnit};
use tact_ir::{AudioKey, AudioMode, ChannelRole, PortValue, SoundConfig};
use tact_master::{Controller, Notification, SoundScope};

const USAGE: &str =
    "Usage: tact-cli [key=value ...] [--config sound.yaml] [--voices N] [--ticks N] [--wav output.wav]";

struct Args {
    pairs: Vec<(String, String)>,
    config_path: Option<String>,
    voices: u16,
    ticks: u64,
    wav_path: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args().unwrap_or_else(|e| {
        eprintln!("{e}\n{USAGE}");
        std::process::exit(1);
    });
    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    });

    println!("Samplerate:  {} Hz", config.samplerate);
    println!("Buffer size: {} frames ({:.1} ticks/s)", config.buffer_size, config.delay());
    println!("Channels:    {}", config.pcm_channels);
    println!("Format:      {}-bit", config.format.bits());
    println!("Threads:     {:?} / {:?}", config.thread_model, config.super_threaded_scope);
    println!();

    let mut ctrl = Controller::new(config).unwrap_or_else(|e| {
        eprintln!("Failed to start session: {e}");
        std::process::exit(1);
    });
    let started = ctrl.with_session(|session| {
        let audio = session.edit(|g| build_demo(g, args.voices, args.ticks));
        audio.and_then(|audio| session.start_playback(audio, SoundScope::Playback).map(|_| ()))
    });
    if let Err(e) = started {
        eprintln!("Failed to build demo graph: {e}");
        std::process::exit(1);
    }

    match &args.wav_path {
        Some(wav) => render_to_wav(&mut ctrl, wav, args.ticks),
        None => play_audio(&mut ctrl),
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        pairs: Vec::new(),
        config_path: None,
        voices: 3,
        ticks: 400,
        wav_path: None,
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().ok_or_else(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--config" => args.config_path = Some(value("--config")?),
            "--wav" => args.wav_path = Some(value("--wav")?),
            "--voices" => {
                args.voices = value("--voices")?
                    .parse()
                    .ok()
                    .filter(|&v| v > 0)
                    .ok_or("--voices must be a positive number")?
            }
            "--ticks" => {
                args.ticks = value("--ticks")?
                    .parse()
                    .map_err(|_| "--ticks must be a number".to_string())?
            }
            pair => match pair.split_once('=') {
                Some((key, value)) => args.pairs.push((key.to_string(), value.to_string())),
                None => return Err(format!("unexpected argument {pair:?}")),
            },
        }
    }
    Ok(args)
}

fn load_config(args: &Args) -> Result<SoundConfig, String> {
    if !args.pairs.is_empty() {
        if args.config_path.is_some() {
            log::warn!("key=value arguments given, ignoring --config");
        }
        return SoundConfig::from_map(args.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map_err(|e| e.to_string());
    }
    let Some(path) = &args.config_path else {
        return Ok(SoundConfig::default());
    };
    let text = fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))?;
    let config: SoundConfig = serde_yaml::from_str(&text).map_err(|e| format!("{path}: {e}"))?;
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// One tone per voice, each mixed into its own output at equal gain. The
/// first voice carries a stream and an envelope, so the playback fades
/// out and finishes after `ticks` ticks.
fn build_demo(g: &mut EngineGraph, voices: u16, ticks: u64) -> Result<AudioKey, tact_master::EngineError> {
    let audio = g.add_audio("voices", AudioMode::Sync, 1);
    let outputs = g.resize(audio, ChannelRole::Output, voices)?.added_channels;
    let inputs = g.resize(audio, ChannelRole::Input, voices)?.added_channels;

    for (i, &input) in inputs.iter().enumerate() {
        let tone = builtin("tone")?;
        tone.set_port("freq", PortValue::Float(220.0 * (i + 1) as f32));
        g.add_recall(Attachment::Channel(input), Some(tone), None)?;
    }
    let stream = builtin("stream")?;
    stream.set_port("length", PortValue::UInt(ticks.max(1)));
    g.add_recall(Attachment::Channel(inputs[0]), Some(stream), None)?;
    g.add_recall(Attachment::Channel(inputs[0]), Some(builtin("envelope")?), None)?;

    for &output in &outputs {
        let volume = builtin("volume")?;
        volume.set_port("gain", PortValue::Float(1.0 / voices as f32));
        g.add_recall(Attachment::Channel(output), Some(builtin("buffer-mixer")?), None)?;
        g.add_recall(Attachment::Channel(output), Some(volume), None)?;
    }
    Ok(audio)
}

fn builtin(name: &'static str) -> Result<tact_engine::RecallHandle, tact_master::EngineError> {
    let body = create_recall(name).ok_or(tact_master::EngineError::Task {
        name: "build-demo",
        reason: format!("no built-in recall {name:?}"),
    })?;
    Ok(RecallUnit::template(body))
}

#[cfg(feature = "cpal")]
fn play_audio(ctrl: &mut Controller) {
    use std::io::Write;

    let events = ctrl.notifications();
    ctrl.play_device();
    println!("Playing...");
    println!();

    while ctrl.is_playing() {
        for event in events.try_iter() {
            match event {
                Notification::Released { .. } => ctrl.stop(),
                Notification::Aborted(reason) => eprintln!("\nAborted: {reason}"),
                Notification::Tick { .. } => {}
            }
        }
        if let Some(frames) = ctrl.position().and_then(|p| p.frames()) {
            print!("\rFrame: {frames:>10}");
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("\rDone.               ");
}

#[cfg(not(feature = "cpal"))]
fn play_audio(_ctrl: &mut Controller) {
    eprintln!("Built without the cpal feature; use --wav to render instead.");
    std::process::exit(1);
}

fn render_to_wav(ctrl: &mut Controller, path: &str, ticks: u64) {
    let config = ctrl.with_session(|s| s.config());
    let seconds = Duration::from_secs_f64(ticks as f64 / config.delay());
    println!("Rendering {ticks} ticks ({seconds:.2?}) to {path}...");

    let events = ctrl.notifications();
    let wav = ctrl.render_to_wav(ticks).unwrap_or_else(|e| {
        eprintln!("Render failed: {e}");
        std::process::exit(1);
    });
    // only the newest notifications are queued
    let (seen, failures) = events.try_iter().fold((0, 0), |(seen, sum), e| match e {
        Notification::Tick { failures, .. } => (seen + 1, sum + failures),
        _ => (seen, sum),
    });
    println!(
        "Rendered {} bytes, {failures} unit failures in the last {seen} ticks",
        wav.len()
    );

    fs::write(path, &wav).unwrap_or_else(|e| {
        eprintln!("Failed to write {path}: {e}");
        std::process::exit(1);
    });

    println!("Done.");
}
