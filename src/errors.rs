use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use log::info;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

/// Failure of a single read (or a single alignment of a read).
///
/// These travel through the pipeline as data. The `Display` text doubles as the
/// reason string of the final failure summary, so it carries no per-read detail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("Move table discordant with {0}")]
    DiscordantMoveTable(Discordance),

    #[error("Invalid CIGAR: {0}")]
    InvalidCigar(&'static str),

    #[error("Missing required tag {0}")]
    MissingRequiredTag(&'static str),

    #[error("Malformed tag {0}")]
    MalformedTag(&'static str),

    #[error("Incomplete read: {0}")]
    IncompleteRead(&'static str),

    #[error("Duplex base call sequence is empty")]
    EmptyDuplexSequence,

    #[error("Read is missing a query-to-signal mapping")]
    MissingCoordinateMap,

    #[error("Batch dataset is full ({capacity} chunks)")]
    BatchFull { capacity: usize },

    #[error("Read id not found in alignment file")]
    ReadNotFound,

    #[error("Read id not found in signal file")]
    SignalNotFound,

    #[error("Malformed signal record: {0}")]
    MalformedSignal(&'static str),

    #[error("Signal record could not be read: {0}")]
    SignalIo(String),

    #[error("Focus position is not a canonical base")]
    NonCanonicalFocus,

    #[error("No valid mappings")]
    NoValidMappings,

    #[error("Alignment record could not be read: {0}")]
    AlignmentIo(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discordance {
    Signal,
    Basecalls,
}

impl fmt::Display for Discordance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Signal => "signal",
            Self::Basecalls => "basecalls",
        };

        write!(f, "{}", s)
    }
}

pub type ReadResult<T> = Result<T, ReadError>;

/// Raised by a stage that hits a fatal error. Every other stage polls it and
/// winds down instead of draining its input.
#[derive(Debug, Default)]
pub struct ErrorFlag(AtomicBool);

impl ErrorFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check<T, E>(&self, res: Result<T, E>) -> Result<T, E> {
        if res.is_err() {
            self.set();
        }

        res
    }
}

#[derive(Debug, Default)]
pub struct ErrorCounts {
    counts: HashMap<String, usize>,
}

impl ErrorCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, err: &ReadError) {
        *self.counts.entry(err.to_string()).or_default() += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn get(&self, reason: &str) -> usize {
        self.counts.get(reason).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn summary(&self) -> Vec<(usize, &str)> {
        let mut summary: Vec<_> = self
            .counts
            .iter()
            .map(|(reason, &n)| (n, reason.as_str()))
            .collect();
        summary.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        summary
    }

    pub fn log_summary(&self) {
        if self.is_empty() {
            return;
        }

        let lines: Vec<_> = self
            .summary()
            .into_iter()
            .map(|(n, reason)| format!("{:>7} : {:<80}", n, reason))
            .collect();
        info!("Unsuccessful read reasons:\n{}", lines.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::{Discordance, ErrorCounts, ErrorFlag, ReadError};

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(
            ReadError::DiscordantMoveTable(Discordance::Signal).to_string(),
            "Move table discordant with signal"
        );
        assert_eq!(
            ReadError::MissingRequiredTag("mv").to_string(),
            "Missing required tag mv"
        );
        assert_eq!(
            ReadError::ReadNotFound.to_string(),
            "Read id not found in alignment file"
        );
    }

    #[test]
    fn summary_sorted_by_frequency() {
        let mut counts = ErrorCounts::new();
        counts.record(&ReadError::ReadNotFound);
        counts.record(&ReadError::NoValidMappings);
        counts.record(&ReadError::ReadNotFound);
        counts.record(&ReadError::DiscordantMoveTable(Discordance::Basecalls));
        counts.record(&ReadError::ReadNotFound);
        counts.record(&ReadError::NoValidMappings);

        let summary = counts.summary();
        assert_eq!(summary[0], (3, "Read id not found in alignment file"));
        assert_eq!(summary[1], (2, "No valid mappings"));
        assert_eq!(summary[2], (1, "Move table discordant with basecalls"));
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.get("No valid mappings"), 2);
    }

    #[test]
    fn error_flag_raised_by_failures() {
        let flag = ErrorFlag::default();
        assert_eq!(flag.check::<_, ()>(Ok(1)), Ok(1));
        assert!(!flag.is_set());

        assert_eq!(flag.check::<i32, _>(Err("boom")), Err("boom"));
        assert!(flag.is_set());
    }
}
