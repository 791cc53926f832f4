//! FFmpeg Runner Module
//!
//! Spawns and supervises ffmpeg/ffprobe. Analysis runs stream stderr through a
//! [`ProgressParser`] while stdout is collected in the background, all under a
//! hard wall-clock limit.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{parse_probe_output, FFmpegError, FFmpegInfo, FFmpegResult, MediaInfo, ProgressParser};
use crate::process::configure_tokio_command;
use crate::{Percent, TimeSec};

/// Upper bound for a single ffprobe call
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a successful supervised run
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    /// Everything the process wrote to stdout
    pub stdout: String,
    /// Input duration reported on stderr, if any
    pub duration: Option<TimeSec>,
}

/// FFmpeg Runner for executing analysis and transcode commands
#[derive(Debug, Clone)]
pub struct FFmpegRunner {
    info: Arc<FFmpegInfo>,
}

impl FFmpegRunner {
    /// Create a new FFmpegRunner from a detected FFmpeg installation
    pub fn new(info: FFmpegInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    pub fn info(&self) -> &FFmpegInfo {
        &self.info
    }

    /// Probe a media file for format and stream information
    pub async fn probe(&self, input: &Path) -> FFmpegResult<MediaInfo> {
        ensure_input_file(input).await?;

        let mut cmd = tokio::process::Command::new(&self.info.ffprobe_path);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input);
        configure_tokio_command(&mut cmd);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| FFmpegError::Timeout(PROBE_TIMEOUT))?
            .map_err(spawn_error)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FFmpegError::ProbeError(format!(
                "FFprobe failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Run ffmpeg with `args`, reporting progress parsed from stderr.
    ///
    /// Exceeding `limit` kills the process and fails with
    /// [`FFmpegError::Timeout`]. A non-zero exit fails with the last few stderr
    /// lines attached.
    pub async fn run_supervised(
        &self,
        args: &[String],
        limit: Duration,
        on_progress: &(dyn Fn(Percent) + Send + Sync),
    ) -> FFmpegResult<AnalysisOutput> {
        let mut cmd = tokio::process::Command::new(&self.info.ffmpeg_path);
        cmd.args(args);
        configure_tokio_command(&mut cmd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(spawn_error)?;
        debug!(pid = ?child.id(), "Spawned ffmpeg");

        let mut stdout = child.stdout.take().ok_or_else(|| {
            FFmpegError::ExecutionFailed("ffmpeg stdout was not captured".to_string())
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            FFmpegError::ExecutionFailed("ffmpeg stderr was not captured".to_string())
        })?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let mut parser = ProgressParser::new();
        let supervised = async {
            let mut chunk = vec![0u8; 8192];
            loop {
                let n = stderr.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                if let Some(pct) = parser.feed(&chunk[..n]) {
                    on_progress(pct);
                }
            }
            if let Some(pct) = parser.finish() {
                on_progress(pct);
            }
            child.wait().await
        };
        let outcome = tokio::time::timeout(limit, supervised).await;

        let status = match outcome {
            Ok(status) => status?,
            Err(_) => {
                warn!(limit = ?limit, "ffmpeg exceeded its time limit, killing");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out ffmpeg: {}", e);
                }
                stdout_task.abort();
                return Err(FFmpegError::Timeout(limit));
            }
        };

        let stdout = match stdout_task.await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(FFmpegError::ProcessError(e)),
            Err(e) => {
                return Err(FFmpegError::ExecutionFailed(format!(
                    "stdout reader failed: {}",
                    e
                )))
            }
        };

        if !status.success() {
            return Err(FFmpegError::ExecutionFailed(format!(
                "ffmpeg exited with {}: {}",
                status,
                parser.tail()
            )));
        }

        Ok(AnalysisOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            duration: parser.duration(),
        })
    }
}

pub(crate) async fn ensure_input_file(input: &Path) -> FFmpegResult<()> {
    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(FFmpegError::InvalidInput(format!(
            "Input is not a file: {}",
            input.display()
        ))),
        Err(_) => Err(FFmpegError::InvalidInput(format!(
            "Input file does not exist: {}",
            input.display()
        ))),
    }
}

pub(crate) fn spawn_error(e: std::io::Error) -> FFmpegError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FFmpegError::NotFound,
        _ => FFmpegError::ProcessError(e),
    }
}
