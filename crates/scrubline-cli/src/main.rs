//! Scrubline command line
//!
//! Drives the core services directly, or through an isolated worker process
//! (`heatmap --isolated`). The `worker` subcommand is that worker.

mod commands;
mod logging;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use scrubline_core::settings::{default_settings_dir, EngineSettings, SettingsManager};

/// Exit status for a transcode rejected by admission control (EX_TEMPFAIL)
pub const EXIT_BUSY: u8 = 75;

#[derive(Parser)]
#[command(name = "scrubline", version, about = "Media heatmaps and transcoding")]
pub struct Cli {
    /// Directory holding settings.json
    #[arg(long, global = true)]
    pub settings_dir: Option<PathBuf>,

    /// Override the heatmap cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Also write daily-rolling log files here
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Path to the ffmpeg binary
    #[arg(long, global = true)]
    pub ffmpeg: Option<PathBuf>,

    /// Path to the ffprobe binary
    #[arg(long, global = true)]
    pub ffprobe: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print stream layout and duration of a media file
    Probe { input: PathBuf },

    /// Compute the loudness/motion heatmap of a media file
    Heatmap {
        input: PathBuf,
        /// Number of points in each series
        #[arg(long)]
        points: Option<f64>,
        /// Run the analysis in a separate worker process
        #[arg(long)]
        isolated: bool,
    },

    /// Transcode to fragmented MP4
    Transcode {
        input: PathBuf,
        /// One of the built-in profiles
        #[arg(long, default_value = "sd_720p")]
        profile: String,
        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,

    /// Inspect or reset persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print the effective settings as JSON
    Show,
    /// Delete the settings file and print defaults
    Reset,
}

impl Cli {
    fn settings_manager(&self) -> SettingsManager {
        SettingsManager::new(
            self.settings_dir
                .clone()
                .unwrap_or_else(default_settings_dir),
        )
    }

    /// Persisted settings with command line overrides applied
    fn effective_settings(&self) -> EngineSettings {
        let mut settings = self.settings_manager().load();
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = Some(dir.clone());
        }
        if let Some(path) = &self.ffmpeg {
            settings.tools.ffmpeg_path = Some(path.clone());
        }
        if let Some(path) = &self.ffprobe {
            settings.tools.ffprobe_path = Some(path.clone());
        }
        settings.normalize();
        settings
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_dir.as_deref(), cli.verbose);

    match commands::run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_override_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = Cli::parse_from([
            "scrubline",
            "heatmap",
            "/m/a.mp4",
            "--points",
            "50",
            "--settings-dir",
            dir.path().to_str().unwrap(),
            "--cache-dir",
            "/tmp/scrubline-cache",
            "--ffmpeg",
            "/opt/ffmpeg",
        ]);

        let settings = cli.effective_settings();
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/tmp/scrubline-cache")));
        assert_eq!(settings.tools.ffmpeg_path, Some(PathBuf::from("/opt/ffmpeg")));
        assert!(matches!(
            cli.command,
            Commands::Heatmap { points: Some(p), isolated: false, .. } if p == 50.0
        ));
    }
}
