//! FFprobe output parsing.

use serde::{Deserialize, Serialize};

use super::{FFmpegError, FFmpegResult};

/// Media information extracted by FFprobe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    /// Duration in seconds (0 when unknown)
    pub duration_sec: f64,
    /// First video stream, if any
    pub video: Option<VideoStreamInfo>,
    /// First audio stream, if any
    pub audio: Option<AudioStreamInfo>,
    /// Container format
    pub format: String,
}

/// Video stream information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    /// Frame rate (frames per second)
    pub fps: f64,
    pub codec: String,
}

/// Audio stream information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub codec: String,
}

/// Which stream kinds an input carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPresence {
    pub has_video: bool,
    pub has_audio: bool,
}

impl StreamPresence {
    /// True if at least one analyzable stream exists
    pub fn any(&self) -> bool {
        self.has_video || self.has_audio
    }
}

impl MediaInfo {
    pub fn streams(&self) -> StreamPresence {
        StreamPresence {
            has_video: self.video.is_some(),
            has_audio: self.audio.is_some(),
        }
    }
}

// Raw ffprobe JSON. Numeric fields arrive as strings in some versions and as
// numbers in others; only the fields read below are declared.
#[derive(Deserialize)]
struct ProbeDocument {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<serde_json::Value>,
    format_name: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_rate: Option<serde_json::Value>,
    channels: Option<u8>,
    disposition: Option<ProbeDisposition>,
}

#[derive(Deserialize)]
struct ProbeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(json_str: &str) -> FFmpegResult<MediaInfo> {
    let doc: ProbeDocument = serde_json::from_str(json_str)
        .map_err(|e| FFmpegError::ParseError(format!("Failed to parse FFprobe output: {}", e)))?;

    let format = doc
        .format
        .ok_or_else(|| FFmpegError::ParseError("Missing format info".to_string()))?;

    let mut video = None;
    let mut audio = None;

    for stream in &doc.streams {
        match stream.codec_type.as_deref() {
            // Cover art shows up as a single-frame video stream.
            Some("video") if video.is_none() && !is_attached_picture(stream) => {
                video = Some(VideoStreamInfo {
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    fps: stream
                        .r_frame_rate
                        .as_deref()
                        .and_then(parse_frame_rate)
                        .unwrap_or(30.0),
                    codec: codec_name(stream),
                });
            }
            Some("audio") if audio.is_none() => {
                audio = Some(AudioStreamInfo {
                    sample_rate: stream
                        .sample_rate
                        .as_ref()
                        .and_then(number_from_value)
                        .map(|v| v as u32)
                        .unwrap_or(44_100),
                    channels: stream.channels.unwrap_or(2),
                    codec: codec_name(stream),
                });
            }
            _ => {}
        }
    }

    Ok(MediaInfo {
        duration_sec: format
            .duration
            .as_ref()
            .and_then(number_from_value)
            .unwrap_or(0.0),
        video,
        audio,
        format: format.format_name.unwrap_or_else(|| "unknown".to_string()),
    })
}

fn is_attached_picture(stream: &ProbeStream) -> bool {
    stream
        .disposition
        .as_ref()
        .is_some_and(|d| d.attached_pic == 1)
}

fn codec_name(stream: &ProbeStream) -> String {
    stream
        .codec_name
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}

fn number_from_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses "30/1", "30000/1001" or a plain number.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => raw.trim().parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output_video_and_audio() {
        let json = r#"{
            "format": {
                "duration": "10.5",
                "size": "1048576",
                "format_name": "mov,mp4,m4a,3gp,3g2,mj2"
            },
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080,
                    "r_frame_rate": "30/1",
                    "pix_fmt": "yuv420p"
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "sample_rate": "48000",
                    "channels": 2
                }
            ]
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_sec, 10.5);
        assert_eq!(
            info.streams(),
            StreamPresence {
                has_video: true,
                has_audio: true
            }
        );

        let video = info.video.unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert_eq!(video.fps, 30.0);
        assert_eq!(video.codec, "h264");

        let audio = info.audio.unwrap();
        assert_eq!(audio.sample_rate, 48000);
        assert_eq!(audio.channels, 2);
    }

    #[test]
    fn test_cover_art_is_not_video() {
        let json = r#"{
            "format": {"duration": 215.3, "format_name": "mp3"},
            "streams": [
                {"codec_type": "audio", "codec_name": "mp3", "sample_rate": 44100, "channels": 2},
                {"codec_type": "video", "codec_name": "mjpeg", "width": 500, "height": 500,
                 "disposition": {"attached_pic": 1}}
            ]
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_sec, 215.3);
        assert!(info.video.is_none());
        assert!(info.streams().has_audio);
    }

    #[test]
    fn test_no_streams_is_not_a_parse_error() {
        let json = r#"{"format": {"format_name": "data"}, "streams": []}"#;
        let info = parse_probe_output(json).unwrap();
        assert!(!info.streams().any());
        assert_eq!(info.duration_sec, 0.0);
    }

    #[test]
    fn test_missing_format_is_parse_error() {
        assert!(matches!(
            parse_probe_output(r#"{"streams": []}"#),
            Err(FFmpegError::ParseError(_))
        ));
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn test_parse_fractional_framerate() {
        let fps = parse_frame_rate("30000/1001").unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
    }
}
