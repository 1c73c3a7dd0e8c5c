//! Per-build mutable workspace.
//!
//! A workspace is created fresh for every (platform, attempt) pair and is
//! exclusively owned by that build attempt. Inside the sandbox it appears at
//! `/workspace` with `srcdir/` (unpacked sources), `destdir/` (the install
//! prefix build scripts populate) and `logs/`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::Platform;

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    /// Failed builds keep their workspace for inspection when set.
    keep_on_drop: bool,
}

impl Workspace {
    /// Create a fresh workspace under `parent` for one build attempt.
    ///
    /// Any leftover tree from a previous attempt at the same path is removed
    /// first; a build attempt never inherits state.
    pub fn create(parent: &Path, name: &str, platform: Platform) -> Result<Self> {
        let root = parent.join(format!("{}-{}", name, platform.triplet()));
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to clear stale workspace {}", root.display()))?;
        }
        for sub in ["srcdir", "destdir", "logs"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create workspace {}", root.display()))?;
        }
        Ok(Self {
            root,
            keep_on_drop: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unpacked source tree; the build script's working directory.
    pub fn srcdir(&self) -> PathBuf {
        self.root.join("srcdir")
    }

    /// The install prefix the build script populates and the auditor inspects.
    pub fn destdir(&self) -> PathBuf {
        self.root.join("destdir")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Scratch area for sandbox plumbing (composed root, spec files).
    pub fn sandbox_dir(&self) -> PathBuf {
        self.root.join(".sandbox")
    }

    /// Keep the tree on drop (failed builds, when configured).
    pub fn keep(&mut self) {
        self.keep_on_drop = true;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.keep_on_drop {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}
