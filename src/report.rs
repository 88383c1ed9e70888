//! Centralized error and warning aggregation.
//!
//! Task actions never abort a run; they record structured errors and
//! warnings here instead. The collected report is drained and rendered
//! exactly once at the end of every run, so records never carry over
//! between invocations. Appends go through one exclusive lock — records
//! from a parallel batch land in some total order, which is all the
//! report format needs.

use std::fmt::{Display, Formatter};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "Error"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

/// A single diagnostic captured during a task's execution window.
#[derive(Debug, Clone)]
pub struct Record {
    pub severity: Severity,
    /// Originating task or tool name.
    pub source: Box<str>,
    /// Human text, typically a path or a short description.
    pub message: String,
    /// Optional positional or code context, e.g. `[3:10]  let x = 1`.
    pub detail: Option<String>,
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<Record>,
    errors: usize,
    warnings: usize,
}

/// Process-wide aggregator shared by every task in a run.
#[derive(Debug, Default)]
pub struct Reporter {
    log: Mutex<Log>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        severity: Severity,
        source: impl Into<Box<str>>,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        let mut log = self.log.lock().unwrap();
        match severity {
            Severity::Error => log.errors += 1,
            Severity::Warning => log.warnings += 1,
        }
        log.records.push(Record {
            severity,
            source: source.into(),
            message: message.into(),
            detail,
        });
    }

    pub fn error_count(&self) -> usize {
        self.log.lock().unwrap().errors
    }

    pub fn warning_count(&self) -> usize {
        self.log.lock().unwrap().warnings
    }

    /// Warnings alone do not constitute failure.
    pub fn has_failures(&self) -> bool {
        self.error_count() > 0
    }

    /// Return the consolidated report and clear the aggregator.
    pub fn drain(&self) -> BuildReport {
        let log = std::mem::take(&mut *self.log.lock().unwrap());
        BuildReport {
            errors: log.errors,
            warnings: log.warnings,
            records: log.records,
        }
    }
}

/// Consolidated per-invocation report, derived from the aggregator.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub errors: usize,
    pub warnings: usize,
    /// Records in append order.
    pub records: Vec<Record>,
}

impl BuildReport {
    pub fn has_failures(&self) -> bool {
        self.errors > 0
    }

    fn summary(&self) -> String {
        let errors = match self.errors {
            1 => "1 error".to_string(),
            n => format!("{n} errors"),
        };
        let warnings = match self.warnings {
            1 => "1 warning".to_string(),
            n => format!("{n} warnings"),
        };
        format!("The project has {errors} & {warnings}")
    }
}

impl Display for BuildReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let summary = self.summary();
        let banner = "=".repeat(summary.len() + 4);

        writeln!(f)?;
        writeln!(f, "{banner}")?;
        writeln!(f)?;
        writeln!(f, "  {summary}  ")?;
        writeln!(f)?;
        writeln!(f, "{banner}")?;
        writeln!(f)?;

        if self.records.is_empty() {
            return Ok(());
        }

        for (i, record) in self.records.iter().enumerate() {
            writeln!(
                f,
                "---[ {} {} ]-------------------------",
                record.severity,
                i + 1
            )?;
            writeln!(f, " |  Path : {}", record.message)?;
            if let Some(detail) = &record.detail {
                for line in detail.lines() {
                    writeln!(f, " |  {line}")?;
                }
            }
            writeln!(f)?;
        }

        writeln!(f, "{banner}")?;
        writeln!(f)
    }
}
