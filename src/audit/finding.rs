//! Structured audit findings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Verbose-only detail (e.g. runtime dispatch detected).
    Info,
    /// Portability hazard; the build is still usable.
    Warning,
    /// The artifact is wrong (e.g. foreign-architecture binary in the prefix).
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Binary's container format/architecture does not match the target.
    PlatformMismatch,
    /// Dynamic dependency referenced by an absolute build-time path.
    AbsoluteLinkage,
    /// Symlink inside the prefix expressed as an absolute path.
    AbsoluteSymlink,
    /// Binary requires a newer instruction-set generation than the baseline.
    InstructionSetCeiling,
    /// Binary self-adapts via runtime capability dispatch (informational).
    RuntimeDispatch,
    /// Declared product has no matching binary in the prefix.
    UnsatisfiedProduct,
}

/// One defect (or notable fact) the auditor observed.
///
/// Findings live for the duration of one audit run; they drive warnings and
/// optional in-place repairs and are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// The file the finding is about (prefix-relative where possible).
    pub path: PathBuf,
    pub message: String,
    /// Whether the auditor knows how to repair this in place.
    pub autofixable: bool,
    /// Set when the repair was applied during this run.
    pub fixed: bool,
}

impl AuditFinding {
    pub fn new(
        kind: FindingKind,
        severity: Severity,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            path: path.into(),
            message: message.into(),
            autofixable: false,
            fixed: false,
        }
    }

    pub fn autofixable(mut self) -> Self {
        self.autofixable = true;
        self
    }

    pub fn mark_fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// Findings that still require attention after autofix ran.
    pub fn outstanding(&self) -> bool {
        !self.fixed && self.severity > Severity::Info
    }
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.fixed {
            " (fixed)"
        } else if self.autofixable {
            " (autofixable)"
        } else {
            ""
        };
        write!(
            f,
            "[{:?}] {}: {}{}",
            self.severity,
            self.path.display(),
            self.message,
            state
        )
    }
}
