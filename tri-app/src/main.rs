#![deny(unsafe_op_in_unsafe_fn)]

use std::fs::{self, File};

use clap::Parser;
use rtri::engine::{Engine, EngineConfig};
use rtri::log::VulkanLogLevel;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
}

/// Slow sinusoidal sweep through hue-ish channel phases, always within
/// [0, 1] and fully opaque.
fn clear_color_at(ticks_ms: u64) -> [f32; 4] {
    let t = ticks_ms as f32 / 1000.0;
    let channel = |phase: f32| ((t + phase).sin() * 0.5 + 0.5).clamp(0.0, 1.0);
    [
        channel(0.0),
        channel(2.0 * std::f32::consts::FRAC_PI_3),
        channel(4.0 * std::f32::consts::FRAC_PI_3),
        1.0,
    ]
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "", "tri-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let config = EngineConfig {
        title: "tri-app".to_owned(),
        width: cli_args.width,
        height: cli_args.height,
        vulkan_log_level: cli_args.graphics_debug_level.map(Into::into),
        shader_roots: None,
    };

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            // The init step codes are the process exit contract; log the
            // detail and exit with the step's code.
            eprintln!("Engine initialisation failed (step code {}): {e}", e.code());
            std::process::exit(e.code());
        }
    };

    if !engine.has_pipeline() {
        tracing::warn!("Running without a triangle pipeline; frames will only clear");
    }

    tracing::trace!("Entering main render loop");
    loop {
        if engine.poll_quit() {
            tracing::info!("Quit requested");
            break;
        }

        let clear_color = clear_color_at(engine.ticks());
        match engine.render_frame(clear_color) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                tracing::debug!("Frame skipped, retrying next tick: {e}");
            }
            Err(e) => {
                return Err(eyre::eyre!("Fatal render error: {e}"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_color_stays_in_unit_range() {
        for ticks in (0..60_000).step_by(137) {
            let [r, g, b, a] = clear_color_at(ticks);
            for channel in [r, g, b] {
                assert!((0.0..=1.0).contains(&channel), "channel {channel} at {ticks}");
            }
            assert_eq!(a, 1.0);
        }
    }

    #[test]
    fn clear_color_actually_changes_over_time() {
        let early = clear_color_at(0);
        let later = clear_color_at(1_500);
        assert_ne!(early, later);
    }
}
