//! Imogen - live vocal harmonizer
//!
//! Sings the held chord back in the performer's own voice. Notes and
//! parameters are typed into the console; type `help` for the list.

mod config;
mod console;

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use tracing_subscriber::EnvFilter;

use imogen_audio::{AudioEvent, EngineHandle, EngineStatus, HarmonizerEngine};

use crate::config::Config;
use crate::console::Command;

/// How often the main thread drains engine events
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Seconds of captured input the queue can hold
const QUEUE_SECONDS: f64 = 0.5;
/// Status messages per logged summary
const SUMMARY_EVERY: u64 = 10;
/// Time given to the output callback to fade out before streams close
const FADE_OUT_WAIT: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = Config::config_path();
    let config = Config::load();
    if !config_path.exists() {
        match config.save_to(&config_path) {
            Ok(()) => tracing::info!(path = %config_path.display(), "Wrote default config"),
            Err(e) => tracing::warn!("Failed to write default config: {}", e),
        }
    }

    let host = cpal::default_host();
    let input_device = input_device(&host, config.input_device.as_deref())?;
    let output_device = output_device(&host, config.output_device.as_deref())?;

    let output_default = output_device
        .default_output_config()
        .context("Failed to get output config")?;
    let input_default = input_device
        .default_input_config()
        .context("Failed to get input config")?;
    if output_default.sample_format() != cpal::SampleFormat::F32
        || input_default.sample_format() != cpal::SampleFormat::F32
    {
        bail!("Only f32 audio devices are supported");
    }

    let sample_rate = output_default.sample_rate();
    let out_channels = output_default.channels() as usize;
    let in_channels = input_default.channels() as usize;
    let output_config: cpal::StreamConfig = output_default.into();
    let input_config = cpal::StreamConfig {
        channels: in_channels as u16,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let mut engine_config = config.engine.clone();
    engine_config.sample_rate = sample_rate.0 as f64;
    let block = engine_config.max_block_size;

    let (cmd_tx, cmd_rx, evt_tx, evt_rx) = EngineHandle::create_channels();
    let mut engine = HarmonizerEngine::with_channels(cmd_rx, evt_tx);
    engine
        .prepare(&engine_config)
        .context("Failed to prepare harmonizer")?;
    let handle = Arc::new(EngineHandle::new(cmd_tx, evt_rx, engine.params()));

    tracing::info!(
        input = %input_device.name().unwrap_or_default(),
        output = %output_device.name().unwrap_or_default(),
        sample_rate = sample_rate.0,
        latency_ms = engine.latency_samples() as f64 * 1000.0 / sample_rate.0 as f64,
        "Audio devices opened"
    );

    // Capture -> engine queue, mono
    let queue_len = (sample_rate.0 as f64 * QUEUE_SECONDS) as usize;
    let (mut producer, mut consumer) = HeapRb::<f32>::new(queue_len).split();
    let overruns = Arc::new(AtomicU64::new(0));
    let overruns_input = overruns.clone();

    let input_stream = input_device
        .build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut lost = 0;
                for frame in data.chunks(in_channels) {
                    let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                    if producer.try_push(mono).is_err() {
                        lost += 1;
                    }
                }
                if lost > 0 {
                    overruns_input.fetch_add(lost, Ordering::Relaxed);
                }
            },
            |err| tracing::error!("Input stream error: {}", err),
            None,
        )
        .with_context(|| format!("Input device must run at {} Hz", sample_rate.0))?;

    // Pre-allocate scratch so the callback never allocates
    let mut mono = vec![0.0f32; block];
    let mut stereo = vec![0.0f32; 2 * block];
    let mut started = false;
    let mut faded = false;
    let stopping = Arc::new(AtomicBool::new(false));
    let stopping_output = stopping.clone();

    let output_stream = output_device
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let fade_out = stopping_output.load(Ordering::Relaxed);
                for chunk in data.chunks_mut(block * out_channels) {
                    if faded {
                        chunk.fill(0.0);
                        continue;
                    }
                    let frames = chunk.len() / out_channels;
                    let input = &mut mono[..frames];
                    let got = consumer.pop_slice(input);
                    input[got..].fill(0.0);

                    let out = &mut stereo[..2 * frames];
                    engine.process(input, out, &[], !started, fade_out);
                    started = true;
                    faded = fade_out;
                    write_frames(chunk, out, out_channels);
                }
            },
            |err| tracing::error!("Output stream error: {}", err),
            None,
        )
        .context("Failed to create output stream")?;

    output_stream.play().context("Failed to start output")?;
    input_stream.play().context("Failed to start input")?;

    println!("{}", console::HELP);
    let console_handle = handle.clone();
    thread::spawn(move || run_console(&console_handle));

    let mut status_count = 0u64;
    while !handle.is_shutdown() {
        for event in handle.poll_events() {
            match event {
                AudioEvent::Status(status) => {
                    status_count += 1;
                    report(&status, status_count);
                }
            }
        }

        let lost = overruns.swap(0, Ordering::Relaxed);
        if lost > 0 {
            tracing::warn!(samples = lost, "Input queue overrun");
        }
        thread::sleep(POLL_INTERVAL);
    }

    stopping.store(true, Ordering::Relaxed);
    thread::sleep(FADE_OUT_WAIT);
    drop(input_stream);
    drop(output_stream);
    tracing::info!("Imogen stopped");
    Ok(())
}

fn run_console(handle: &EngineHandle) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match Command::parse(&line).and_then(|command| command.execute(handle)) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => println!("{e:#}"),
        }
    }
    // stdin closed
    handle.shutdown();
}

fn report(status: &EngineStatus, count: u64) {
    let stats = &status.stats;
    if stats.dropped_grains > 0 || stats.dropped_notes > 0 || status.dropped_events > 0 {
        tracing::warn!(
            dropped_grains = stats.dropped_grains,
            dropped_notes = stats.dropped_notes,
            dropped_events = status.dropped_events,
            "Harmonizer overloaded"
        );
    }
    if count % SUMMARY_EVERY == 0 {
        tracing::debug!(
            input_hz = status.input_hz,
            confidence = status.estimate.confidence,
            voices = stats.active_voices,
            peak_grains = stats.peak_active_grains,
            grain_capacity = stats.grain_capacity,
            "Status"
        );
    }
}

/// Copy interleaved stereo into a device buffer of any channel count
fn write_frames(device: &mut [f32], stereo: &[f32], channels: usize) {
    for (frame, lr) in device.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
        match frame {
            [mono] => *mono = 0.5 * (lr[0] + lr[1]),
            [left, right, rest @ ..] => {
                *left = lr[0];
                *right = lr[1];
                rest.fill(0.0);
            }
            [] => {}
        }
    }
}

fn input_device(host: &cpal::Host, name: Option<&str>) -> anyhow::Result<cpal::Device> {
    match name {
        Some(name) => named(host.input_devices()?, name),
        None => host
            .default_input_device()
            .context("No audio input device found"),
    }
}

fn output_device(host: &cpal::Host, name: Option<&str>) -> anyhow::Result<cpal::Device> {
    match name {
        Some(name) => named(host.output_devices()?, name),
        None => host
            .default_output_device()
            .context("No audio output device found"),
    }
}

fn named(
    mut devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> anyhow::Result<cpal::Device> {
    devices
        .find(|d| d.name().is_ok_and(|n| n == name))
        .with_context(|| format!("Audio device '{name}' not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO: [f32; 4] = [1.0, 0.0, 0.25, 0.75];

    #[test]
    fn test_write_frames_mono() {
        let mut device = [9.0f32; 2];
        write_frames(&mut device, &STEREO, 1);
        assert_eq!(device, [0.5, 0.5]);
    }

    #[test]
    fn test_write_frames_stereo() {
        let mut device = [9.0f32; 4];
        write_frames(&mut device, &STEREO, 2);
        assert_eq!(device, STEREO);
    }

    #[test]
    fn test_write_frames_surround_zeroes_extra_channels() {
        let mut device = [9.0f32; 8];
        write_frames(&mut device, &STEREO, 4);
        assert_eq!(device, [1.0, 0.0, 0.0, 0.0, 0.25, 0.75, 0.0, 0.0]);
    }
}
