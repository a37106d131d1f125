#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Record,
    Reconcile,
    Registry,
    Durability,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only account of the decisions and recoveries made during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let summary = summary.into();
        log::debug!("{kind:?}: {summary}");
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary,
        });
    }

    /// Records a recovered fault and surfaces it as a warning.
    pub fn warn(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let summary = summary.into();
        log::warn!("{summary}");
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary,
        });
    }

    pub fn record_checkpoint_decode_failure<E>(&mut self, path: &Path, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.warn(
            EvidenceKind::Durability,
            format!("checkpoint decode failure path={}: {error}", path.display()),
        );
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes one JSON object per entry.
    pub fn write_jsonl(&self, output_path: &Path) -> Result<(), String> {
        let mut lines = String::new();
        for entry in &self.entries {
            let line = serde_json::to_string(entry)
                .map_err(|error| format!("failed to serialize evidence entry: {error}"))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "failed to create evidence output dir {}: {error}",
                    parent.display()
                )
            })?;
        }

        fs::write(output_path, lines).map_err(|error| {
            format!(
                "failed to write evidence log {}: {error}",
                output_path.display()
            )
        })
    }
}

/// Human readable duration keeping at most `max_units` of the smaller units
/// (days and hours are always shown).
#[must_use]
pub fn format_duration(seconds: f64, max_units: usize) -> String {
    if seconds == 0.0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    if seconds < 0.0 {
        out.push('-');
    }
    let mut t = seconds.abs();
    let mut used = 0usize;

    let days = (t / 86_400.0) as u64;
    if days > 0 {
        out.push_str(&format!("{days}d"));
        used += 1;
        t -= days as f64 * 86_400.0;
    }

    let hours = (t / 3_600.0) as u64;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
        used += 1;
        t -= hours as f64 * 3_600.0;
    }

    let minutes = (t / 60.0) as u64;
    if minutes > 0 && used < max_units {
        out.push_str(&format!("{minutes}m"));
        used += 1;
        t -= minutes as f64 * 60.0;
    }

    let secs = t as u64;
    if secs > 0 && used < max_units {
        out.push_str(&format!("{secs}s"));
        used += 1;
        t -= secs as f64;
    }

    let millis = (1e3 * t) as u64;
    let micros = (1e6 * t - 1_000.0 * millis as f64) as u64;
    if used + 1 < max_units && micros > 0 {
        if millis > 0 {
            out.push_str(&format!("{millis}ms{micros:03}"));
        } else {
            out.push_str(&format!("{micros}us"));
        }
    } else if used < max_units && millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }

    out
}

/// Two-digit "odometer" bar: the tens digit and unit digit of the progress
/// (in `width`-ths) are drawn on top of each other.
#[must_use]
pub fn progress_bar(i: usize, per_epoch: usize, width: usize) -> String {
    if per_epoch == 0 || width == 0 {
        return String::new();
    }
    let n = width * width;
    let step = ((i * n) as f64 / per_epoch as f64).round() as usize;

    let lss = step % width;
    let mss = step / width;

    let n_both = mss.min(lss);
    let n_mss = mss.saturating_sub(lss);
    let n_lss = lss.saturating_sub(mss);
    let n_blank = width.saturating_sub(n_both + n_mss + n_lss);

    let mut bar = String::with_capacity(width);
    bar.extend(std::iter::repeat_n('ø', n_both));
    bar.extend(std::iter::repeat_n('o', n_mss));
    bar.extend(std::iter::repeat_n('/', n_lss));
    bar.extend(std::iter::repeat_n(' ', n_blank));
    bar
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
