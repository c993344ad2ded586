//! Scrapes download percentages out of yt-dlp's console output.
//!
//! yt-dlp has no structured progress channel on stdout, so we match its
//! `[download]  42.0% of ...` lines. This is the only place that knows about
//! that format.

use std::sync::LazyLock;

use regex::Regex;

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").expect("valid progress regex"));

/// Highest value reported while the process is still running. 100 is only
/// ever sent by the orchestrator once the output file is in place.
pub const RUNNING_CEILING: f64 = 99.0;

/// Per-job parser state. Emits strictly increasing percentages.
#[derive(Debug, Default)]
pub struct ProgressParser {
    last: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a chunk (one or more lines) and returns the percentages worth
    /// publishing, in order. Repeats and regressions are dropped.
    pub fn feed(&mut self, chunk: &str) -> Vec<f64> {
        let mut emitted = Vec::new();
        for captures in PROGRESS_RE.captures_iter(chunk) {
            let Some(percent) = captures
                .get(1)
                .and_then(|value| value.as_str().parse::<f64>().ok())
            else {
                continue;
            };
            let percent = percent.min(RUNNING_CEILING);
            if self.last.is_some_and(|last| percent <= last) {
                continue;
            }
            self.last = Some(percent);
            emitted.push(percent);
        }
        emitted
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regressions_are_dropped() {
        let mut parser = ProgressParser::new();
        let mut seen = Vec::new();
        for line in [
            "[download]  10.0% of 12.00MiB at 1.00MiB/s ETA 00:10",
            "[download]   7.0% of 12.00MiB at 1.00MiB/s ETA 00:12",
            "[download]  55.5% of 12.00MiB at 2.00MiB/s ETA 00:03",
        ] {
            seen.extend(parser.feed(line));
        }
        assert_eq!(seen, vec![10.0, 55.5]);
        assert_eq!(parser.last(), Some(55.5));
    }

    #[test]
    fn duplicates_and_noise_emit_nothing() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("[download]  20.0% of 1MiB"), vec![20.0]);
        assert!(parser.feed("[download]  20.0% of 1MiB").is_empty());
        assert!(parser.feed("[youtube] dQw4w9WgXcQ: Downloading webpage").is_empty());
        assert!(parser.feed("[download] Destination: downloads/x.mp4").is_empty());
        assert!(parser.feed("[download]  3").is_empty());
        assert!(parser.feed("").is_empty());
    }

    #[test]
    fn full_completion_is_clamped_below_hundred() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("[download] 100% of 5.00MiB in 00:02"), vec![99.0]);
        assert!(parser.feed("[download] 100.0% of 5.00MiB").is_empty());
    }

    #[test]
    fn multi_line_chunks_are_scanned_in_order() {
        let mut parser = ProgressParser::new();
        let chunk = "[download]   1.5% of 9MiB\r[download]   0.9% of 9MiB\n[download]  42.0% of 9MiB\n";
        assert_eq!(parser.feed(chunk), vec![1.5, 42.0]);
    }

    #[test]
    fn emitted_values_stay_increasing_and_bounded() {
        let mut parser = ProgressParser::new();
        let inputs = [
            "[download] 5%", "[download] 99.9%", "[download] 3%", "[download] 150%",
            "[download] 60%", "[download] 99%",
        ];
        let mut out = Vec::new();
        for input in inputs {
            out.extend(parser.feed(input));
        }
        assert!(out.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(out.iter().all(|value| (0.0..=RUNNING_CEILING).contains(value)));
        assert_eq!(out, vec![5.0, 99.0]);
    }
}
