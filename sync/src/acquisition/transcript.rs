//! Downloader stdout parsing

use std::sync::OnceLock;

use media_sync_core::AcquisitionStatus;
use regex::Regex;

/// Percent reported once transcoding has started
pub const CONVERTING_PERCENT: u8 = 99;

const CONVERTING_MARKERS: [&str; 2] = ["[ExtractAudio]", "[ffmpeg]"];

fn progress_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[download\]\s+([\d.]+)%").ok())
        .as_ref()
}

/// One observation pulled out of the downloader's output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadUpdate {
    pub status: AcquisitionStatus,
    pub percent: u8,
}

impl DownloadUpdate {
    pub fn downloading(percent: u8) -> Self {
        Self {
            status: AcquisitionStatus::Downloading,
            percent,
        }
    }

    pub fn converting() -> Self {
        Self {
            status: AcquisitionStatus::Converting,
            percent: CONVERTING_PERCENT,
        }
    }
}

/// Line-at-a-time parser for a single download.
///
/// Once a converting marker has been seen, later download percentages are
/// ignored so the reported phase never moves backwards. Repeats of the same
/// rounded percentage are suppressed.
#[derive(Debug, Clone, Default)]
pub struct TranscriptParser {
    converting: bool,
    last_percent: Option<u8>,
}

impl TranscriptParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_converting(&self) -> bool {
        self.converting
    }

    pub fn parse_line(&mut self, line: &str) -> Option<DownloadUpdate> {
        let line = line.trim();

        if CONVERTING_MARKERS.iter().any(|marker| line.starts_with(marker)) {
            if self.converting {
                return None;
            }
            self.converting = true;
            return Some(DownloadUpdate::converting());
        }

        if self.converting {
            return None;
        }

        let captures = progress_pattern()?.captures(line)?;
        let percent = parse_percent(captures.get(1)?.as_str())?;
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(DownloadUpdate::downloading(percent))
    }
}

fn parse_percent(text: &str) -> Option<u8> {
    let value: f64 = text.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.round().clamp(0.0, 100.0) as u8)
}
