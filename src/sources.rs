// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sources file handling.
//!
//! Large source archives are not committed to Git. Instead, the working copy
//! carries a small line-oriented __sources file__ that records which files
//! belong to the package, and the digest each one must hash to. The archives
//! themselves live in the lookaside cache.
//!
//! # Line Formats
//!
//! Two line formats coexist in the wild. The __tagged__ format, also called
//! the BSD format, matches the output of `sha512sum --tag`:
//!
//! ```text
//! SHA512 (foo-1.0.tar.gz) = 9b71d224bd62f378...
//! ```
//!
//! The __legacy__ format matches the output of a plain `md5sum`, and always
//! implies md5:
//!
//! ```text
//! 5d41402abc4b2a76b9719d911017c592  foo-1.0.tar.gz
//! ```
//!
//! Both formats are always accepted when reading. The [`EntryFormat`] given
//! to [`SourcesFile`] only decides how entries get written back out, so
//! loading a legacy file and writing it with the tagged format migrates it.
//!
//! # Hash Type Mixing
//!
//! New entries must use the same hash algorithm as the entries already
//! present. A sources file that mixes algorithms would silently verify some
//! files with weaker guarantees than others. Mixed files found on disk are
//! still read, but nothing more can be added to them until the whole file is
//! regenerated.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Serialization format used when writing sources file entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EntryFormat {
    /// Legacy `hash  filename` format.
    #[serde(rename = "old")]
    Legacy,

    /// Tagged `HASHTYPE (filename) = hash` format.
    #[default]
    #[serde(rename = "bsd")]
    Tagged,
}

impl EntryFormat {
    /// Render an entry as one line of text, newline included.
    pub fn format(&self, entry: &SourceEntry) -> String {
        match self {
            Self::Legacy => format!("{}  {}\n", entry.hash, entry.file),
            Self::Tagged => format!(
                "{} ({}) = {}\n",
                entry.hashtype.to_uppercase(),
                entry.file,
                entry.hash
            ),
        }
    }
}

/// One tracked source file.
///
/// # Invariant
///
/// - Hash type is always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceEntry {
    pub(crate) hashtype: String,
    pub(crate) file: String,
    pub(crate) hash: String,
}

impl SourceEntry {
    /// Construct new source entry.
    pub fn new(
        hashtype: impl AsRef<str>,
        file: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            hashtype: hashtype.as_ref().to_lowercase(),
            file: file.into(),
            hash: hash.into(),
        }
    }

    /// Parse one line of a sources file.
    ///
    /// Returns `None` for blank lines. Tries the tagged format first, then
    /// falls back on the legacy format.
    ///
    /// # Errors
    ///
    /// - Return [`SourcesError::MalformedLine`] if line matches neither
    ///   format.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let stripped = line.trim();
        if stripped.is_empty() {
            return Ok(None);
        }

        if let Some(entry) = parse_tagged(stripped) {
            return Ok(Some(entry));
        }

        match stripped.split_once("  ") {
            Some((hash, file)) => Ok(Some(Self::new("md5", file, hash))),
            None => Err(SourcesError::MalformedLine(line.trim_end_matches('\n').into())),
        }
    }

    /// Lowercase name of hash algorithm.
    pub fn hashtype(&self) -> &str {
        &self.hashtype
    }

    /// Base name of source file.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Expected hex digest of source file.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

// Grammar: `<hashtype> (<file>) = <hash>`, where none of the three parts
// contain a space, and the file name contains no ')'.
fn parse_tagged(line: &str) -> Option<SourceEntry> {
    let (hashtype, rest) = line.split_once(" (")?;
    let (file, hash) = rest.split_once(") = ")?;

    let valid = !hashtype.is_empty()
        && !hashtype.contains(' ')
        && !file.is_empty()
        && !file.contains([' ', ')'])
        && !hash.is_empty()
        && !hash.contains(' ');

    valid.then(|| SourceEntry::new(hashtype, file, hash))
}

/// Sources file of a package.
///
/// Keeps an ordered, duplicate free listing of [`SourceEntry`] that is
/// rewritten in full on [`SourcesFile::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcesFile {
    path: PathBuf,
    format: EntryFormat,
    entries: Vec<SourceEntry>,
}

impl SourcesFile {
    /// Load sources file at target path.
    ///
    /// A missing sources file is treated as an empty one. Duplicate lines
    /// collapse into one entry.
    ///
    /// # Errors
    ///
    /// - Return [`SourcesError::ReadSourcesFile`] if existing file cannot be
    ///   read.
    /// - Return [`SourcesError::MalformedLine`] if any line cannot be parsed.
    pub fn open(path: impl Into<PathBuf>, format: EntryFormat) -> Result<Self> {
        let mut sources = Self::replace(path, format);
        if !sources.path.exists() {
            debug!("no sources file at {:?}", sources.path.display());
            return Ok(sources);
        }

        let content = read_to_string(&sources.path).map_err(|err| SourcesError::ReadSourcesFile {
            source: err,
            path: sources.path.clone(),
        })?;

        for line in content.lines() {
            if let Some(entry) = SourceEntry::parse_line(line)? {
                if !sources.entries.contains(&entry) {
                    sources.entries.push(entry);
                }
            }
        }

        Ok(sources)
    }

    /// Start an empty sources file at target path.
    ///
    /// Existing content at target path is ignored, and will be overwritten by
    /// the next call to [`SourcesFile::write`].
    pub fn replace(path: impl Into<PathBuf>, format: EntryFormat) -> Self {
        Self {
            path: path.into(),
            format,
            entries: Vec::new(),
        }
    }

    /// Add new entry.
    ///
    /// Adding an entry identical to an existing one does nothing.
    ///
    /// # Errors
    ///
    /// - Return [`SourcesError::HashtypeMixing`] if any existing entry uses a
    ///   different hash type. Listing is left untouched.
    pub fn add_entry(
        &mut self,
        hashtype: impl AsRef<str>,
        file: impl Into<String>,
        hash: impl Into<String>,
    ) -> Result<()> {
        let entry = SourceEntry::new(hashtype, file, hash);

        for existing in &self.entries {
            if existing.hashtype != entry.hashtype {
                return Err(SourcesError::HashtypeMixing {
                    existing: existing.hashtype.clone(),
                    new: entry.hashtype,
                });
            }

            if *existing == entry {
                return Ok(());
            }
        }

        self.entries.push(entry);

        Ok(())
    }

    /// Check if a file name is tracked.
    pub fn contains(&self, file: impl AsRef<str>) -> bool {
        self.entries.iter().any(|entry| entry.file == file.as_ref())
    }

    /// Current listing of entries in insertion order.
    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    /// Path to sources file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite sources file with current listing of entries.
    ///
    /// # Errors
    ///
    /// - Return [`SourcesError::WriteSourcesFile`] if sources file cannot be
    ///   written.
    pub fn write(&self) -> Result<()> {
        write(&self.path, self.to_string()).map_err(|err| SourcesError::WriteSourcesFile {
            source: err,
            path: self.path.clone(),
        })
    }
}

impl Display for SourcesFile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for entry in &self.entries {
            fmt.write_str(&self.format.format(entry))?;
        }

        Ok(())
    }
}

/// Sources file error types.
#[derive(Debug, thiserror::Error)]
pub enum SourcesError {
    /// Line matches neither the tagged nor the legacy format.
    #[error("malformed line in sources file: {0:?}")]
    MalformedLine(String),

    /// New entry would mix hash types.
    #[error("cannot mix {new} hash with existing {existing} hash in sources file")]
    HashtypeMixing { existing: String, new: String },

    /// Sources file cannot be read from.
    #[error("failed to read sources file at {:?}", path.display())]
    ReadSourcesFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Sources file cannot be written to.
    #[error("failed to write sources file at {:?}", path.display())]
    WriteSourcesFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = SourcesError> = std::result::Result<T, E>;
