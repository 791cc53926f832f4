//! Streaming transcodes.
//!
//! ffmpeg writes a fragmented MP4 to stdout so the caller can forward bytes as
//! they are produced. Each session owns a [`TranscodePermit`]; the slot is
//! returned when the session finishes, is cancelled, or is dropped.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runner::{ensure_input_file, spawn_error};
use super::{FFmpegError, FFmpegResult, FFmpegRunner, ProgressParser};
use crate::admission::TranscodePermit;
use crate::process::configure_tokio_command;

/// Output settings for a streaming transcode
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeProfile {
    /// Preset name used on the command line
    pub name: String,
    /// Output width; height follows the aspect ratio
    pub width: u32,
    /// Video codec (e.g., "libx264")
    pub video_codec: String,
    /// Audio codec (e.g., "aac")
    pub audio_codec: String,
    /// Video bitrate (e.g., "2500k")
    pub video_bitrate: String,
    /// Audio bitrate (e.g., "128k")
    pub audio_bitrate: String,
    /// x264 preset
    pub preset: String,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self::sd_720p()
    }
}

impl TranscodeProfile {
    /// Preset for phones on constrained links
    pub fn mobile_480p() -> Self {
        Self {
            name: "mobile_480p".to_string(),
            width: 854,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "1000k".to_string(),
            audio_bitrate: "96k".to_string(),
            preset: "veryfast".to_string(),
        }
    }

    pub fn sd_720p() -> Self {
        Self {
            name: "sd_720p".to_string(),
            width: 1280,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "2500k".to_string(),
            audio_bitrate: "128k".to_string(),
            preset: "veryfast".to_string(),
        }
    }

    pub fn hd_1080p() -> Self {
        Self {
            name: "hd_1080p".to_string(),
            width: 1920,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: "5000k".to_string(),
            audio_bitrate: "192k".to_string(),
            preset: "fast".to_string(),
        }
    }

    /// Looks up a preset by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mobile_480p" => Some(Self::mobile_480p()),
            "sd_720p" => Some(Self::sd_720p()),
            "hd_1080p" => Some(Self::hd_1080p()),
            _ => None,
        }
    }

    /// Names accepted by [`TranscodeProfile::from_name`]
    pub fn names() -> &'static [&'static str] {
        &["mobile_480p", "sd_720p", "hd_1080p"]
    }

    /// Full ffmpeg argument list for streaming `input` to stdout.
    pub fn ffmpeg_args(&self, input: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vf".to_string(),
            // -2 keeps the height even, which libx264 requires
            format!("scale={}:-2", self.width),
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-b:v".to_string(),
            self.video_bitrate.clone(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
            "-movflags".to_string(),
            "frag_keyframe+empty_moov".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            "pipe:1".to_string(),
        ]
    }
}

/// A running transcode.
///
/// Read [`TranscodeSession::take_stdout`] concurrently with or before
/// [`TranscodeSession::wait`]; ffmpeg blocks once the pipe buffer is full.
pub struct TranscodeSession {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<ProgressParser>>,
    permit: TranscodePermit,
}

impl std::fmt::Debug for TranscodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSession")
            .field("pid", &self.child.id())
            .field("stdout_taken", &self.stdout.is_none())
            .field("permit_released", &self.permit.is_released())
            .finish()
    }
}

impl FFmpegRunner {
    /// Spawns a streaming transcode of `input`, holding `permit` until it ends.
    ///
    /// If spawning fails the permit is dropped here, which releases it.
    pub async fn spawn_transcode(
        &self,
        input: &Path,
        profile: &TranscodeProfile,
        permit: TranscodePermit,
    ) -> FFmpegResult<TranscodeSession> {
        ensure_input_file(input).await?;

        let mut cmd = tokio::process::Command::new(&self.info().ffmpeg_path);
        cmd.args(profile.ffmpeg_args(input));
        configure_tokio_command(&mut cmd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(spawn_error)?;
        info!(
            input = %input.display(),
            profile = %profile.name,
            pid = ?child.id(),
            "Transcode started"
        );

        let stdout = child.stdout.take();
        // stderr must be drained or ffmpeg stalls; keep the tail for errors.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut parser = ProgressParser::new();
                let mut chunk = vec![0u8; 4096];
                while let Ok(n) = stderr.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    parser.feed(&chunk[..n]);
                }
                parser.finish();
                parser
            })
        });

        Ok(TranscodeSession {
            child,
            stdout,
            stderr_task,
            permit,
        })
    }
}

impl TranscodeSession {
    /// Takes the fragmented MP4 byte stream. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// OS process id, while the process is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for ffmpeg to exit and releases the permit.
    pub async fn wait(mut self) -> FFmpegResult<ExitStatus> {
        let status = self.child.wait().await;
        self.permit.release();
        let status = status?;

        if status.success() {
            debug!("Transcode finished");
            return Ok(status);
        }

        let tail = match self.stderr_task.take() {
            Some(task) => task.await.map(|p| p.tail()).unwrap_or_default(),
            None => String::new(),
        };
        Err(FFmpegError::ExecutionFailed(format!(
            "Transcode exited with {}: {}",
            status, tail
        )))
    }

    /// Kills ffmpeg (e.g. the client went away) and releases the permit.
    pub async fn cancel(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill transcode: {}", e);
        }
        self.permit.release();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        info!("Transcode cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_by_name() {
        for name in TranscodeProfile::names() {
            let profile = TranscodeProfile::from_name(name).unwrap();
            assert_eq!(profile.name, *name);
        }
        assert!(TranscodeProfile::from_name("8k_hdr").is_none());
        assert_eq!(TranscodeProfile::default(), TranscodeProfile::sd_720p());
    }

    #[test]
    fn test_args_stream_fragmented_mp4_to_stdout() {
        let args = TranscodeProfile::mobile_480p().ffmpeg_args(Path::new("/media/in.mov"));
        let joined = args.join(" ");
        assert!(joined.contains("-i /media/in.mov"));
        assert!(joined.contains("scale=854:-2"));
        assert!(joined.contains("-movflags frag_keyframe+empty_moov"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[cfg(unix)]
    mod process {
        use std::time::Duration;

        use tempfile::TempDir;

        use super::*;
        use crate::admission::TranscodeAdmission;
        use crate::ffmpeg::runner::test_support::{runner_with, write_script};

        #[tokio::test]
        async fn test_session_streams_stdout_and_releases_permit() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = write_script(dir.path(), "ffmpeg", "printf 'ftypisom'");
            let input = dir.path().join("in.mov");
            std::fs::write(&input, b"x").unwrap();
            let runner = runner_with(ffmpeg, dir.path().join("ffprobe"));

            let admission = TranscodeAdmission::new(1);
            let permit = admission.try_acquire().unwrap();
            let mut session = runner
                .spawn_transcode(&input, &TranscodeProfile::default(), permit)
                .await
                .unwrap();
            assert_eq!(admission.active(), 1);

            let mut out = Vec::new();
            session
                .take_stdout()
                .unwrap()
                .read_to_end(&mut out)
                .await
                .unwrap();
            assert_eq!(out, b"ftypisom");

            session.wait().await.unwrap();
            assert_eq!(admission.active(), 0);
        }

        #[tokio::test]
        async fn test_cancel_releases_permit() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = write_script(dir.path(), "ffmpeg", "exec sleep 10");
            let input = dir.path().join("in.mov");
            std::fs::write(&input, b"x").unwrap();
            let runner = runner_with(ffmpeg, dir.path().join("ffprobe"));

            let admission = TranscodeAdmission::new(1);
            let session = runner
                .spawn_transcode(&input, &TranscodeProfile::default(), admission.try_acquire().unwrap())
                .await
                .unwrap();
            assert!(admission.try_acquire().is_err());

            tokio::time::timeout(Duration::from_secs(5), session.cancel())
                .await
                .unwrap();
            assert_eq!(admission.active(), 0);
            assert!(admission.try_acquire().is_ok());
        }

        #[tokio::test]
        async fn test_failed_spawn_releases_permit() {
            let dir = TempDir::new().unwrap();
            let input = dir.path().join("in.mov");
            std::fs::write(&input, b"x").unwrap();
            let runner = runner_with(dir.path().join("missing"), dir.path().join("ffprobe"));

            let admission = TranscodeAdmission::new(1);
            let result = runner
                .spawn_transcode(&input, &TranscodeProfile::default(), admission.try_acquire().unwrap())
                .await;
            assert!(matches!(result, Err(FFmpegError::NotFound)));
            assert_eq!(admission.active(), 0);
        }
    }
}
