use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

/// Result of running a job, or the roll-up of a group of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobStatus>,
}

impl JobStatus {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            children: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Severity::Ok, "ok")
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn cancel() -> Self {
        Self::new(Severity::Cancel, "canceled")
    }

    /// A multi-status whose severity is the worst of its children.
    pub fn multi(message: impl Into<String>, children: Vec<JobStatus>) -> Self {
        let severity = children
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Ok);
        Self {
            severity,
            message: message.into(),
            children,
        }
    }

    /// Append a child, raising the severity if needed.
    pub fn add(&mut self, child: JobStatus) {
        self.severity = self.severity.max(child.severity);
        self.children.push(child);
    }

    /// Convert a fallible body outcome into a status.
    pub fn from_result<E: fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::error(e.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    pub fn is_multi(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn matches(&self, severity: Severity) -> bool {
        self.severity == severity
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.severity, self.message)
    }
}
