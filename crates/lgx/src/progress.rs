//! 📊 progress.rs: "Are we there yet?" asked by every log pipeline, every time, forever.
//!
//! 🚀 Two things live here. A live progress bar fed by the source worker as it
//! chews through input files, and the end-of-run summary table the CLI prints
//! once the dust settles.
//!
//! ⚠️ Watching the bar will not make the engine index faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};

use crate::common::RunSummary;

const MIB: u64 = 1024 * 1024;

/// ⏳ Rates are measured over this much recent history, so one slow file doesn't tank the display.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 "1000000" → "1,000,000". Eyes, you're welcome.
fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS when the run has gone long enough to miss lunch.
fn human_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📡 Lines and megabytes per second, as of right now.
struct Rates {
    lines_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Tracks input consumption and renders it onto an indicatif bar.
pub(crate) struct ProgressMetrics {
    /// 🏷️ what we're reading, for the header line
    label: String,
    /// 📏 total input bytes, 0 when unknown
    total_size: u64,
    total_bytes: u64,
    total_lines: u64,
    total_records: u64,
    progress_bar: ProgressBar,
    /// 🔄 (when, bytes, lines) samples inside the rate window
    samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 🎭 ProgressBar has no Debug of its own
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .field("total_lines", &self.total_lines)
            .field("total_records", &self.total_records)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(label: String, total_size: u64) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        match ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            Ok(style) => progress_bar.set_style(style.progress_chars("=>-")),
            Err(_) => progress_bar.set_style(ProgressStyle::default_bar()),
        }
        let start_time = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((start_time, 0u64, 0u64));
        Self {
            label,
            total_size,
            total_bytes: 0,
            total_lines: 0,
            total_records: 0,
            progress_bar,
            samples,
            start_time,
        }
    }

    /// 🔄 One chunk of input consumed.
    pub(crate) fn update(&mut self, bytes_read: u64, lines_read: u64, records_parsed: u64) {
        self.total_bytes += bytes_read;
        self.total_lines += lines_read;
        self.total_records += records_parsed;
        let rates = self.rolling_rates();
        self.render(rates);
        self.progress_bar.set_position(self.total_bytes);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn rolling_rates(&mut self) -> Rates {
        let now = Instant::now();
        while let Some(&(timestamp, _, _)) = self.samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, self.total_bytes, self.total_lines));

        if let Some(&(oldest, oldest_bytes, oldest_lines)) = self.samples.front() {
            let elapsed = now.duration_since(oldest).as_secs_f64();
            if elapsed > 0.0 {
                return Rates {
                    lines_per_sec: self.total_lines.saturating_sub(oldest_lines) as f64 / elapsed,
                    mib_per_sec: self.total_bytes.saturating_sub(oldest_bytes) as f64 / elapsed / MIB as f64,
                };
            }
        }
        Rates {
            lines_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    fn render(&self, rates: Rates) {
        let percent = if self.total_size > 0 {
            self.total_bytes as f64 / self.total_size as f64 * 100.0
        } else {
            0.0
        };
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 {
            let remaining_secs = elapsed.as_secs_f64() / (percent / 100.0) - elapsed.as_secs_f64();
            if remaining_secs > 0.0 {
                human_duration(Duration::from_secs_f64(remaining_secs))
            } else {
                "--:--".to_string()
            }
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        let right = |text: String| Cell::new(text).set_alignment(CellAlignment::Right);
        table.add_row(vec![
            right(format!("{} lines/s", group_digits(rates.lines_per_sec as u64))),
            right(format!("{} lines", group_digits(self.total_lines))),
        ]);
        table.add_row(vec![
            right(format!("{:.2} MiB/s", rates.mib_per_sec)),
            right(format!("{} records", group_digits(self.total_records))),
        ]);
        table.add_row(vec![
            right(format!("{} elapsed", human_duration(elapsed))),
            right(format!("{remaining} remaining ({percent:.1}%)")),
        ]);
        self.progress_bar
            .set_message(format!("source: {}\n{}", self.label, table));
    }
}

/// 🧾 The end-of-run table. The CLI prints it; tests read it.
pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["📊 metric", "value"]);
    let rows: [(&str, String); 8] = [
        ("lines read", group_digits(summary.lines_read)),
        ("records parsed", group_digits(summary.records_parsed)),
        ("lines skipped", group_digits(summary.lines_skipped)),
        ("batches submitted", group_digits(summary.batches_submitted)),
        ("records indexed", group_digits(summary.records_indexed)),
        ("records failed", group_digits(summary.records_failed)),
        ("oversize (413) events", group_digits(summary.oversize_events)),
        ("final batch size", group_digits(summary.final_batch_size as u64)),
    ];
    for (metric, value) in rows {
        table.add_row(vec![Cell::new(metric), Cell::new(value).set_alignment(CellAlignment::Right)]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_grow_an_hours_column() {
        assert_eq!(human_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(human_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_the_summary_table_has_every_number() {
        let summary = RunSummary {
            lines_read: 12_000,
            records_parsed: 11_990,
            lines_skipped: 10,
            batches_submitted: 2,
            records_indexed: 11_989,
            records_failed: 1,
            oversize_events: 1,
            final_batch_size: 8_000,
        };
        let rendered = summary_table(&summary).to_string();
        for needle in ["12,000", "11,990", "11,989", "8,000", "records failed", "oversize"] {
            assert!(rendered.contains(needle), "missing {needle} in\n{rendered}");
        }
    }

    #[test]
    fn the_one_where_updates_add_up() {
        let mut metrics = ProgressMetrics::new("test".into(), 100);
        metrics.update(40, 4, 3);
        metrics.update(60, 6, 6);
        metrics.finish();
        assert_eq!(metrics.total_bytes, 100);
        assert_eq!(metrics.total_lines, 10);
        assert_eq!(metrics.total_records, 9);
        assert!(format!("{metrics:?}").contains("total_lines: 10"));
    }
}
