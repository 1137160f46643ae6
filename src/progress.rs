//! Sync and backfill progress reporting.
//!
//! Reports observable progress during `dfe sync` and `dfe backfill` so
//! users see which taxpayer is being fetched and how far a cycle or job has
//! come. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts. The engine only talks to the [`SyncProgressReporter`] trait and
//! never to a terminal.

use std::io::Write;

/// Pipeline phase carried by every event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    /// Cursor feed: `n` batches done, `total` unknown until the cycle ends.
    Syncing,
    /// Targeted backfill: `n` of `total` keys processed.
    Backfilling,
}

impl SyncPhase {
    fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Syncing => "syncing",
            SyncPhase::Backfilling => "backfilling",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncProgressEvent {
    pub taxpayer_id: String,
    pub phase: SyncPhase,
    pub n: u64,
    pub total: Option<u64>,
    pub message: String,
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "backfill 12345678000195  5 / 20  promoted ...".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let counts = match event.total {
            Some(total) => format!("{} / {}", format_number(event.n), format_number(total)),
            None => format!("batch {}", format_number(event.n)),
        };
        let line = format!(
            "{} {}  {}  {}\n",
            event.phase.as_str(),
            event.taxpayer_id,
            counts,
            event.message
        );
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "taxpayer": event.taxpayer_id,
            "phase": event.phase.as_str(),
            "n": event.n,
            "total": event.total,
            "message": event.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Collects events in memory for engine and backfill tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingProgress {
    events: std::sync::Mutex<Vec<SyncProgressEvent>>,
}

#[cfg(test)]
impl RecordingProgress {
    pub(crate) fn events(&self) -> Vec<SyncProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl SyncProgressReporter for RecordingProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn parses_modes() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
