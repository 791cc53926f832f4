//! Incremental parsing of ffmpeg diagnostic output.
//!
//! ffmpeg writes its input summary and the rolling `frame=... time=...` status
//! line to stderr. The status line is refreshed with `\r`, and pipe reads split
//! lines at arbitrary byte offsets, so the parser buffers bytes and only parses
//! complete lines (terminated by `\n` or `\r`).

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use crate::{Percent, TimeSec};

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("valid duration regex")
});

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("valid time regex")
});

/// Number of recent stderr lines kept for error reports
const TAIL_LINES: usize = 8;

/// Parses `H:MM:SS.ms` into seconds.
pub fn parse_timestamp(raw: &str) -> Option<TimeSec> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Line-buffered parser for the `Duration:` / `time=` grammar.
#[derive(Debug, Default)]
pub struct ProgressParser {
    partial: Vec<u8>,
    duration: Option<TimeSec>,
    current: Option<TimeSec>,
    tail: VecDeque<String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw chunk. Returns the new progress if this chunk moved it.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Percent> {
        let before = self.progress();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte == b'\n' || *byte == b'\r' {
                self.partial.extend_from_slice(&chunk[start..i]);
                let line = std::mem::take(&mut self.partial);
                self.parse_line(&String::from_utf8_lossy(&line));
                start = i + 1;
            }
        }
        self.partial.extend_from_slice(&chunk[start..]);

        let after = self.progress();
        if after != before {
            after
        } else {
            None
        }
    }

    /// Parses whatever is left in the buffer once the stream has ended.
    pub fn finish(&mut self) -> Option<Percent> {
        if self.partial.is_empty() {
            return None;
        }
        let before = self.progress();
        let line = std::mem::take(&mut self.partial);
        self.parse_line(&String::from_utf8_lossy(&line));
        let after = self.progress();
        if after != before {
            after
        } else {
            None
        }
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if self.duration.is_none() {
            if let Some(caps) = DURATION_RE.captures(line) {
                self.duration = parse_timestamp(&caps[1]);
            }
        }

        // A status line may carry several updates if ffmpeg flushed late; the
        // last one is the freshest.
        if let Some(caps) = TIME_RE.captures_iter(line).last() {
            if let Some(t) = parse_timestamp(&caps[1]) {
                self.current = Some(t);
            }
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// Total input duration, once seen
    pub fn duration(&self) -> Option<TimeSec> {
        self.duration
    }

    /// Latest reported position
    pub fn current_time(&self) -> Option<TimeSec> {
        self.current
    }

    /// `min(100, round(current / duration * 100))`, when both are known.
    pub fn progress(&self) -> Option<Percent> {
        let duration = self.duration.filter(|d| *d > 0.0)?;
        let current = self.current?;
        let pct = (current / duration * 100.0).round().clamp(0.0, 100.0);
        Some(pct as Percent)
    }

    /// Most recent complete lines, oldest first
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:40.00"), Some(40.0));
        assert_eq!(parse_timestamp("1:02:03.5"), Some(3723.5));
        assert_eq!(parse_timestamp("00:01:00"), Some(60.0));
        assert_eq!(parse_timestamp("N/A"), None);
    }

    #[test]
    fn test_duration_then_time_yields_progress() {
        let mut parser = ProgressParser::new();
        assert_eq!(
            parser.feed(b"  Duration: 00:00:40.00, start: 0.000000, bitrate: 1205 kb/s\n"),
            None
        );
        assert_eq!(parser.duration(), Some(40.0));

        let p = parser.feed(b"frame=  300 fps=0.0 q=-0.0 size=N/A time=00:00:10.00 bitrate=N/A speed=20x\r");
        assert_eq!(p, Some(25));
        assert_eq!(parser.current_time(), Some(10.0));
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut parser = ProgressParser::new();
        parser.feed(b"  Durat");
        parser.feed(b"ion: 00:01:");
        assert_eq!(parser.duration(), None);
        parser.feed(b"40.00, start: 0\n");
        assert_eq!(parser.duration(), Some(100.0));

        assert_eq!(parser.feed(b"size=N/A time=00:00:3"), None);
        assert_eq!(parser.feed(b"3.40 bitrate=N/A\r"), Some(33));
    }

    #[test]
    fn test_partial_line_is_parsed_on_finish() {
        let mut parser = ProgressParser::new();
        parser.feed(b"Duration: 00:00:10.00,\n");
        parser.feed(b"time=00:00:10.00");
        assert_eq!(parser.progress(), None);
        assert_eq!(parser.finish(), Some(100));
    }

    #[test]
    fn test_progress_is_capped_at_100() {
        let mut parser = ProgressParser::new();
        parser.feed(b"Duration: 00:00:10.00,\ntime=00:00:12.50 bitrate\n");
        assert_eq!(parser.progress(), Some(100));
    }

    #[test]
    fn test_duration_is_only_taken_once() {
        let mut parser = ProgressParser::new();
        parser.feed(b"Duration: 00:00:10.00,\nDuration: 00:05:00.00,\n");
        assert_eq!(parser.duration(), Some(10.0));
    }

    #[test]
    fn test_unknown_duration_has_no_progress() {
        let mut parser = ProgressParser::new();
        parser.feed(b"Duration: N/A, bitrate: N/A\ntime=00:00:05.00\n");
        assert_eq!(parser.progress(), None);
        assert_eq!(parser.current_time(), Some(5.0));
    }

    #[test]
    fn test_tail_keeps_recent_lines() {
        let mut parser = ProgressParser::new();
        for i in 0..20 {
            parser.feed(format!("line {i}\n").as_bytes());
        }
        let tail = parser.tail();
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
    }
}
