use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Marker printed by the downloader once the final file has been moved into
/// place (see `--print after_move:OUTPUT|%(filepath)s`).
pub const OUTPUT_PATH_MARKER: &str = "OUTPUT|";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    /// Always within `0.0..=100.0`.
    pub percent: f64,
    pub transfer_rate: String,
    pub eta: String,
}

impl ProgressSample {
    pub fn fraction(&self) -> f64 {
        self.percent / 100.0
    }
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\[download\]\s+(?P<percent>[0-9.]+)%.*?\bat\s+(?P<rate>\S.*?/s)\s+ETA\s+(?P<eta>\S+)",
        )
        .expect("progress pattern is valid")
    })
}

/// Extracts a progress sample from one line of downloader output.
///
/// Only a full structural match produces a sample. A percentage that does not
/// parse as a number makes the whole line a non-match.
pub fn parse(line: &str) -> Option<ProgressSample> {
    let caps = progress_regex().captures(line.trim())?;
    let percent: f64 = caps.name("percent")?.as_str().parse().ok()?;
    if !percent.is_finite() {
        return None;
    }
    Some(ProgressSample {
        percent: percent.clamp(0.0, 100.0),
        transfer_rate: caps.name("rate")?.as_str().trim().to_string(),
        eta: caps.name("eta")?.as_str().to_string(),
    })
}

pub fn parse_output_path(line: &str) -> Option<&str> {
    let path = line.trim().strip_prefix(OUTPUT_PATH_MARKER)?.trim();
    if path.is_empty() {
        return None;
    }
    Some(path)
}
