// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Gitignore ledger.
//!
//! Source archives uploaded to the lookaside cache must never end up
//! committed into Git. Thus, every file registered in the sources file also
//! gets a matching line in the working copy's `.gitignore`. This module keeps
//! that file in sync without duplicating lines that an existing pattern
//! already covers.

use glob::Pattern;
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Manage lines of a `.gitignore` file.
///
/// # Invariant
///
/// - Each line is newline terminated.
/// - File is only written when lines were added since the last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIgnore {
    path: PathBuf,
    lines: Vec<String>,
    modified: bool,
}

impl GitIgnore {
    /// Load gitignore file at target path.
    ///
    /// A missing file starts out empty, and gets created on first write.
    ///
    /// # Errors
    ///
    /// - Return [`GitIgnoreError::ReadGitIgnore`] if existing file cannot be
    ///   read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut lines = Vec::new();

        if path.exists() {
            let content = read_to_string(&path).map_err(|err| GitIgnoreError::ReadGitIgnore {
                source: err,
                path: path.clone(),
            })?;
            lines.extend(content.split_inclusive('\n').map(|line| {
                if line.ends_with('\n') {
                    line.to_string()
                } else {
                    format!("{line}\n")
                }
            }));
        }

        Ok(Self {
            path,
            lines,
            modified: false,
        })
    }

    /// Add a line unless an existing line already matches it.
    pub fn add(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if self.matches(line) {
            debug!("{line:?} already covered by {:?}", self.path.display());
            return;
        }

        let line = if line.ends_with('\n') {
            line.to_string()
        } else {
            format!("{line}\n")
        };
        self.lines.push(line);
        self.modified = true;
    }

    /// Check if a line matches any existing line.
    ///
    /// Leading slashes are ignored on both sides. Existing lines are
    /// treated as shell glob patterns, so `*.tar.gz` covers `/foo.tar.gz`.
    pub fn matches(&self, line: impl AsRef<str>) -> bool {
        let line = normalize(line.as_ref());

        self.lines.iter().map(|entry| normalize(entry)).any(|entry| {
            match Pattern::new(entry) {
                Ok(pattern) => pattern.matches(line),
                Err(_) => entry == line,
            }
        })
    }

    /// Check if lines were added since the last write.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Current lines, each newline terminated.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Path to gitignore file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write lines back to gitignore file if modified.
    ///
    /// # Errors
    ///
    /// - Return [`GitIgnoreError::WriteGitIgnore`] if file cannot be written.
    pub fn write(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        write(&self.path, self.lines.concat()).map_err(|err| GitIgnoreError::WriteGitIgnore {
            source: err,
            path: self.path.clone(),
        })?;
        self.modified = false;

        Ok(())
    }
}

fn normalize(line: &str) -> &str {
    line.trim_start_matches('/').trim_end_matches(['\r', '\n'])
}

/// Gitignore ledger error types.
#[derive(Debug, thiserror::Error)]
pub enum GitIgnoreError {
    /// Gitignore file cannot be read from.
    #[error("failed to read gitignore file at {:?}", path.display())]
    ReadGitIgnore {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Gitignore file cannot be written to.
    #[error("failed to write gitignore file at {:?}", path.display())]
    WriteGitIgnore {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = GitIgnoreError> = std::result::Result<T, E>;
