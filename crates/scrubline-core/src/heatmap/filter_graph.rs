//! ffmpeg filter graph for the activity analysis pass.
//!
//! Both chains print per-window metadata to stdout as `key=value` lines; every
//! other line there (frame/pts headers) is ignored by [`parse_samples`].

use std::path::Path;

use super::{AUDIO_FLOOR_DB, MOTION_FLOOR};
use crate::ffmpeg::MediaInfo;

/// Metadata key printed once per analyzed video frame (1 fps)
pub const MOTION_PRINT_KEY: &str = "lavfi.signalstats.YAVG";
/// Metadata key printed once per one-second audio window
pub const AUDIO_PRINT_KEY: &str = "lavfi.astats.Overall.RMS_level";

const FALLBACK_SAMPLE_RATE: u32 = 44_100;

/// Which chains to run and how to window the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterGraph {
    pub video: bool,
    pub audio: bool,
    /// Audio samples per one-second window
    pub sample_rate: u32,
}

impl FilterGraph {
    /// Graph for the streams present in `info`; `None` if there are none.
    pub fn for_media(info: &MediaInfo) -> Option<Self> {
        let streams = info.streams();
        if !streams.any() {
            return None;
        }
        Some(Self {
            video: streams.has_video,
            audio: streams.has_audio,
            sample_rate: info
                .audio
                .as_ref()
                .map(|a| a.sample_rate)
                .filter(|sr| *sr > 0)
                .unwrap_or(FALLBACK_SAMPLE_RATE),
        })
    }

    /// The `-filter_complex` value, one labeled output per active chain.
    pub fn filter_complex(&self) -> String {
        let mut chains = Vec::with_capacity(2);
        if self.video {
            chains.push(format!(
                "[0:v:0]fps=1,scale=64:-1,tblend=all_mode=difference,signalstats,\
                 metadata=print:key={MOTION_PRINT_KEY}:file=-[v]"
            ));
        }
        if self.audio {
            chains.push(format!(
                "[0:a:0]asetnsamples=n={}:p=0,astats=metadata=1:reset=1,\
                 ametadata=print:key={AUDIO_PRINT_KEY}:file=-[a]",
                self.sample_rate
            ));
        }
        chains.join(";")
    }

    /// Complete ffmpeg arguments mapping only the active outputs to the null muxer.
    pub fn ffmpeg_args(&self, input: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-filter_complex".to_string(),
            self.filter_complex(),
        ];
        if self.video {
            args.extend(["-map".to_string(), "[v]".to_string()]);
        }
        if self.audio {
            args.extend(["-map".to_string(), "[a]".to_string()]);
        }
        args.extend(["-f".to_string(), "null".to_string(), "-".to_string()]);
        args
    }
}

/// Raw per-second values in stream order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSeries {
    pub audio: Vec<f64>,
    pub motion: Vec<f64>,
}

/// Extracts the printed metadata values for the active chains.
///
/// Non-finite values (silence reports `-inf`) become the series floor;
/// unparseable values are skipped.
pub fn parse_samples(stdout: &str, graph: &FilterGraph) -> SampleSeries {
    let mut series = SampleSeries::default();

    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let (target, floor) = match key {
            MOTION_PRINT_KEY if graph.video => (&mut series.motion, MOTION_FLOOR),
            AUDIO_PRINT_KEY if graph.audio => (&mut series.audio, AUDIO_FLOOR_DB),
            _ => continue,
        };
        if let Ok(v) = value.trim().parse::<f64>() {
            target.push(if v.is_finite() { v } else { floor });
        }
    }

    series
}
