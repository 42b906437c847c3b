//! Text extraction from ffmpeg's diagnostic stream.
//!
//! Everything here is pure and tolerant: an absent or garbled token gives
//! back the "unknown" value (`0.0` / `None`), never an error.

use regex::Regex;
use std::sync::OnceLock;

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern")
    })
}

fn elapsed_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(?:time|out_time)=\s*(-?\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
            .expect("elapsed pattern")
    })
}

fn dimensions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Video:.*?[\s,](\d{2,5})x(\d{2,5})(?:[\s,\[]|$)").expect("dimensions pattern")
    })
}

fn hms_to_seconds(h: &str, m: &str, s: &str) -> Option<f64> {
    let h: f64 = h.parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    if h < 0.0 {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Input duration from a `Duration: HH:MM:SS.xx` token, or 0.0.
pub fn parse_duration(text: &str) -> f64 {
    duration_regex()
        .captures(text)
        .and_then(|caps| hms_to_seconds(&caps[1], &caps[2], &caps[3]))
        .unwrap_or(0.0)
}

/// Position of the last `time=HH:MM:SS.xx` token in `text`, or 0.0.
pub fn parse_elapsed(text: &str) -> f64 {
    elapsed_regex()
        .captures_iter(text)
        .last()
        .and_then(|caps| hms_to_seconds(&caps[1], &caps[2], &caps[3]))
        .unwrap_or(0.0)
}

/// Frame size from the first `Video: ... WxH` stream line.
pub fn parse_dimensions(text: &str) -> Option<(u32, u32)> {
    let caps = dimensions_regex().captures(text)?;
    let width: u32 = caps[1].parse().ok()?;
    let height: u32 = caps[2].parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

/// `min(100, round(current / duration * 100))`; 0 when the duration is unknown.
pub fn percent(current_seconds: f64, duration_seconds: f64) -> u8 {
    if !(duration_seconds > 0.0) || !(current_seconds > 0.0) {
        return 0;
    }
    (current_seconds / duration_seconds * 100.0).round().min(100.0) as u8
}

/// Per-job progress state: turns stderr lines into percentages that never
/// go backwards and reach 100 once, on `finish`.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration: f64,
    /// Duration fixed by the caller (trim or probe); stderr can't override it
    pinned: bool,
    start_offset: f64,
    last: Option<u8>,
    dimensions: Option<(u32, u32)>,
}

impl ProgressTracker {
    /// `known_duration` is the effective output duration if already known
    /// (trim length or probed length). Without it the tracker learns the
    /// input duration from the stream, minus `start_offset`.
    pub fn new(known_duration: Option<f64>, start_offset: f64) -> Self {
        let pinned = known_duration.is_some_and(|d| d > 0.0);
        Self {
            duration: known_duration.filter(|d| *d > 0.0).unwrap_or(0.0),
            pinned,
            start_offset: start_offset.max(0.0),
            last: None,
            dimensions: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Source frame size if the stream reported one.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    /// Feeds one stderr line. Returns a new percentage only when it is
    /// higher than anything reported before; capped at 99 until `finish`.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        if !self.pinned && self.duration <= 0.0 {
            let input = parse_duration(line);
            if input > 0.0 {
                self.duration = (input - self.start_offset).max(0.0);
            }
        }
        if self.dimensions.is_none() {
            self.dimensions = parse_dimensions(line);
        }

        let elapsed = parse_elapsed(line);
        if elapsed <= 0.0 {
            return None;
        }
        let value = percent(elapsed, self.duration).min(99);
        self.advance(value)
    }

    /// Marks the job complete. Returns 100 unless it was already reported.
    pub fn finish(&mut self) -> Option<u8> {
        self.advance(100)
    }

    fn advance(&mut self, value: u8) -> Option<u8> {
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_token() {
        let line = "  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s";
        assert_eq!(parse_duration(line), 62.5);
        assert_eq!(parse_duration("Duration: N/A, bitrate: N/A"), 0.0);
        assert_eq!(parse_duration(""), 0.0);
    }

    #[test]
    fn parses_elapsed_token() {
        let line = "frame=  120 fps= 60 q=-0.0 size=    512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=2x";
        assert_eq!(parse_elapsed(line), 4.0);
        assert_eq!(parse_elapsed("out_time=00:00:01.500000"), 1.5);
        assert_eq!(parse_elapsed("time=N/A bitrate=N/A"), 0.0);
        assert_eq!(parse_elapsed("time=-577014:32:22.77"), 0.0);
    }

    #[test]
    fn elapsed_takes_latest_token() {
        let text = "time=00:00:01.00\ntime=00:00:03.00\n";
        assert_eq!(parse_elapsed(text), 3.0);
    }

    #[test]
    fn parses_stream_dimensions() {
        let line = "  Stream #0:0(und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(tv, bt709), 1920x1080 [SAR 1:1 DAR 16:9], 4999 kb/s, 30 fps";
        assert_eq!(parse_dimensions(line), Some((1920, 1080)));
        assert_eq!(parse_dimensions("Stream #0:1: Audio: aac, 48000 Hz"), None);
        assert_eq!(parse_dimensions("Video: gif, bgra, 480x270, q=2-31"), Some((480, 270)));
    }

    #[test]
    fn percent_is_clamped_and_rounded() {
        assert_eq!(percent(5.0, 10.0), 50);
        assert_eq!(percent(3.333, 10.0), 33);
        assert_eq!(percent(12.0, 10.0), 100);
        assert_eq!(percent(5.0, 0.0), 0);
        assert_eq!(percent(0.0, 10.0), 0);
    }

    #[test]
    fn tracker_learns_duration_from_stream() {
        let mut tracker = ProgressTracker::new(None, 0.0);
        assert_eq!(tracker.observe("  Duration: 00:00:10.00, start: 0.0"), None);
        assert_eq!(tracker.duration(), 10.0);
        assert_eq!(tracker.observe("frame=1 time=00:00:02.50"), Some(25));
    }

    #[test]
    fn tracker_subtracts_start_offset() {
        let mut tracker = ProgressTracker::new(None, 4.0);
        tracker.observe("Duration: 00:00:10.00");
        assert_eq!(tracker.duration(), 6.0);
        assert_eq!(tracker.observe("time=00:00:03.00"), Some(50));
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let mut tracker = ProgressTracker::new(Some(10.0), 0.0);
        let seen: Vec<u8> = [
            "time=00:00:02.00",
            "time=00:00:05.00",
            "time=00:00:04.00",
            "time=00:00:05.00",
            "time=00:00:07.00",
        ]
        .iter()
        .filter_map(|l| tracker.observe(l))
        .collect();
        assert_eq!(seen, vec![20, 50, 70]);
    }

    #[test]
    fn hundred_is_reported_once_on_finish() {
        let mut tracker = ProgressTracker::new(Some(10.0), 0.0);
        assert_eq!(tracker.observe("time=00:00:10.00"), Some(99));
        assert_eq!(tracker.observe("time=00:00:11.00"), None);
        assert_eq!(tracker.finish(), Some(100));
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn pinned_duration_ignores_stream_duration() {
        let mut tracker = ProgressTracker::new(Some(2.0), 0.0);
        tracker.observe("Duration: 00:01:00.00");
        assert_eq!(tracker.duration(), 2.0);
        assert_eq!(tracker.observe("time=00:00:01.00"), Some(50));
    }
}
