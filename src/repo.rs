// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package working copy.
//!
//! A package working copy is a Git repository holding a spec file, patches,
//! and a sources file. The large source archives listed in the sources file
//! are kept out of Git, and shuttled to and from the lookaside cache instead.
//!
//! # Upload Flow
//!
//! Each file to upload is hashed, registered in the sources file, added to
//! `.gitignore`, and handed over to the lookaside cache, strictly one after
//! another. The sources file and `.gitignore` are only written once every
//! upload in the batch went through, and are then staged in the Git index.
//! Thus, an interrupted batch never leaves behind sources file entries for
//! files that the cache does not have.
//!
//! # Download Flow
//!
//! Every entry of the sources file is downloaded into an output directory,
//! the working copy by default. Entries already present with the right
//! digest are skipped without any network traffic.

use crate::{
    config::{Config, RequestParam},
    gitignore::{GitIgnore, GitIgnoreError},
    hash::{file_is_valid, hash_file, HashError},
    lookaside::{progress::Progress, LookasideCache, LookasideError, TemplateFields},
    sources::{SourceEntry, SourcesError, SourcesFile},
};

use git2::Repository;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Name of the sources file at the top-level of a working copy.
pub const SOURCES_FILE: &str = "sources";

/// Name of the gitignore file at the top-level of a working copy.
pub const GITIGNORE_FILE: &str = ".gitignore";

/// Package working copy.
pub struct PackageRepo {
    path: PathBuf,
    repository: Repository,
    config: Config,
}

impl PackageRepo {
    /// Open package working copy at target path.
    ///
    /// Target path must be the top-level of a non-bare Git repository.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Git2`] if target path is not a Git repository.
    /// - Return [`RepoError::BareRepository`] if repository has no work tree.
    pub fn open(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        debug!("open package working copy: {:?}", path.display());
        let repository = Repository::open(&path)?;
        if repository.is_bare() {
            return Err(RepoError::BareRepository(path));
        }

        Ok(Self {
            path,
            repository,
            config,
        })
    }

    /// Path to top-level of working copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path to sources file.
    pub fn sources_path(&self) -> PathBuf {
        self.path.join(SOURCES_FILE)
    }

    /// Path to gitignore file.
    pub fn gitignore_path(&self) -> PathBuf {
        self.path.join(GITIGNORE_FILE)
    }

    /// Name of package.
    ///
    /// Uses configured package name, falling back on the name of the working
    /// copy directory.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoPackageName`] if no name can be determined.
    pub fn module_name(&self) -> Result<String> {
        if let Some(name) = &self.config.package.name {
            return Ok(name.clone());
        }

        self.path
            .canonicalize()
            .unwrap_or_else(|_| self.path.clone())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| RepoError::NoPackageName(self.path.clone()))
    }

    /// Name of package as the lookaside cache knows it.
    ///
    /// Prefixed with the package namespace if the lookaside cache is
    /// namespaced.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoPackageName`] if no name can be determined.
    pub fn lookaside_name(&self) -> Result<String> {
        let name = self.module_name()?;
        match (&self.config.package.namespace, self.config.lookaside.namespaced) {
            (Some(namespace), true) => Ok(format!("{namespace}/{name}")),
            _ => Ok(name),
        }
    }

    /// Lookaside cache client built from configuration.
    pub fn lookaside_cache(&self) -> LookasideCache {
        LookasideCache::from(&self.config.lookaside)
    }

    /// Upstream branch that the current branch merges from.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoBranchMerge`] if HEAD is detached, or current
    ///   branch tracks nothing.
    pub fn branch_merge(&self) -> Result<String> {
        let head = self.repository.head()?;
        if !head.is_branch() {
            return Err(RepoError::NoBranchMerge("HEAD".into()));
        }

        let branch = head.shorthand().unwrap_or_default().to_string();
        let merge = self
            .repository
            .config()?
            .get_string(&format!("branch.{branch}.merge"))
            .map_err(|_| RepoError::NoBranchMerge(branch.clone()))?;

        Ok(merge
            .strip_prefix("refs/heads/")
            .map(str::to_owned)
            .unwrap_or(merge))
    }

    /// Download all source files listed in sources file.
    ///
    /// Output directory defaults to the working copy, and is created if
    /// missing. Skipped entirely if there is no sources file.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::CreateOutdir`] if output directory cannot be
    ///   created.
    /// - Return [`RepoError::Sources`] if sources file cannot be loaded.
    /// - Return [`RepoError::Lookaside`] if any download fails.
    #[instrument(skip(self, outdir, progress), level = "debug")]
    pub async fn sources(&self, outdir: Option<&Path>, progress: Option<Progress>) -> Result<()> {
        let sources_path = self.sources_path();
        if !sources_path.exists() {
            info!("sources file doesn't exist, source files download skipped");
            return Ok(());
        }

        let outdir = outdir.unwrap_or(self.path.as_path());
        mkdirp::mkdirp(outdir).map_err(|err| RepoError::CreateOutdir {
            source: err,
            path: outdir.to_path_buf(),
        })?;

        let sources = SourcesFile::open(sources_path, self.config.sources.entry_format)?;
        let cache = self.lookaside_cache();
        let name = self.lookaside_name()?;
        let extra = self.request_fields()?;

        for entry in sources.entries() {
            cache
                .download(&name, entry, outdir.join(entry.file()), &extra, progress.clone())
                .await?;
        }

        Ok(())
    }

    /// Upload source files to lookaside cache.
    ///
    /// Appends to the current sources file, or starts a fresh one if
    /// `replace` is set. Sources file and gitignore file are written and
    /// staged once all uploads succeed.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::HashtypeMixing`] if a new entry would mix hash
    ///   types in the sources file.
    /// - Return [`RepoError::Hash`] if a file cannot be hashed.
    /// - Return [`RepoError::Lookaside`] if any upload fails.
    /// - Return [`RepoError::Git2`] if files cannot be staged.
    #[instrument(skip(self, files, progress), level = "debug")]
    pub async fn upload(
        &self,
        files: &[PathBuf],
        replace: bool,
        progress: Option<Progress>,
    ) -> Result<()> {
        let format = self.config.sources.entry_format;
        let sources_path = self.sources_path();
        let mut sources = if replace {
            SourcesFile::replace(&sources_path, format)
        } else {
            SourcesFile::open(&sources_path, format)?
        };
        let mut gitignore = GitIgnore::open(self.gitignore_path())?;
        let cache = self.lookaside_cache();
        let name = self.lookaside_name()?;

        for file in files {
            let hash = hash_file(file, cache.hashtype())?;
            let basename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| RepoError::NotAFile(file.clone()))?;

            sources
                .add_entry(cache.hashtype(), &basename, &hash)
                .map_err(|err| match err {
                    SourcesError::HashtypeMixing { existing, new } => RepoError::HashtypeMixing {
                        existing,
                        new,
                        sources: sources_path.clone(),
                    },
                    err => err.into(),
                })?;
            gitignore.add(format!("/{basename}"));
            cache.upload(&name, file, &hash, progress.clone()).await?;
        }

        sources.write()?;
        gitignore.write()?;
        self.stage([SOURCES_FILE, GITIGNORE_FILE])?;

        Ok(())
    }

    /// Find patches tracked by neither Git nor the sources file.
    ///
    /// Only `*.patch` files at the top-level of the working copy are
    /// considered.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Glob`] if working copy path cannot be used as a
    ///   glob pattern.
    /// - Return [`RepoError::Sources`] if sources file cannot be loaded.
    pub fn find_untracked_patches(&self) -> Result<Vec<String>> {
        let pattern = self.path.join("*.patch");
        let mut patches = glob::glob(&pattern.to_string_lossy())?
            .filter_map(std::result::Result::ok)
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect::<Vec<_>>();
        patches.sort();

        let tree = self
            .repository
            .head()
            .ok()
            .and_then(|head| head.peel_to_tree().ok());
        let sources = SourcesFile::open(self.sources_path(), self.config.sources.entry_format)?;

        Ok(patches
            .into_iter()
            .filter(|patch| {
                let in_git = tree
                    .as_ref()
                    .is_some_and(|tree| tree.get_path(Path::new(patch)).is_ok());
                !in_git && !sources.contains(patch)
            })
            .collect())
    }

    /// Check local copies of every source file against the sources file.
    ///
    /// Never touches the network.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Sources`] if sources file cannot be loaded.
    /// - Return [`RepoError::Hash`] if a local file cannot be hashed.
    pub fn check_sources(&self, dir: Option<&Path>) -> Result<Vec<(SourceEntry, FileStatus)>> {
        let dir = dir.unwrap_or(self.path.as_path());
        let sources = SourcesFile::open(self.sources_path(), self.config.sources.entry_format)?;

        sources
            .entries()
            .iter()
            .map(|entry| -> Result<_> {
                let path = dir.join(entry.file());
                let status = if !path.exists() {
                    FileStatus::Missing
                } else if file_is_valid(&path, entry.hash(), entry.hashtype())? {
                    FileStatus::Valid
                } else {
                    FileStatus::Invalid
                };
                Ok((entry.clone(), status))
            })
            .collect()
    }

    fn request_fields(&self) -> Result<TemplateFields> {
        let mut fields = TemplateFields::new();
        for param in &self.config.lookaside.request_params {
            match param {
                RequestParam::Branch => {
                    fields.insert("branch".into(), self.branch_merge()?);
                }
            }
        }

        Ok(fields)
    }

    fn stage<'a>(&self, files: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut index = self.repository.index()?;
        for file in files {
            // INVARIANT: Only stage what exists, an untouched gitignore may not.
            if self.path.join(file).exists() {
                debug!("stage {file}");
                index.add_path(Path::new(file))?;
            }
        }
        index.write()?;

        Ok(())
    }
}

/// State of a local source file compared to its sources file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// File exists with expected digest.
    Valid,

    /// File exists with unexpected digest.
    Invalid,

    /// File does not exist.
    Missing,
}

impl Display for FileStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Valid => fmt.write_str("valid"),
            Self::Invalid => fmt.write_str("INVALID"),
            Self::Missing => fmt.write_str("missing"),
        }
    }
}

/// Package working copy error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Repository has no work tree.
    #[error("{:?} is a bare repository", .0.display())]
    BareRepository(PathBuf),

    /// Package name cannot be determined.
    #[error("cannot determine package name from {:?}", .0.display())]
    NoPackageName(PathBuf),

    /// Current branch does not track a remote branch.
    #[error("branch {0:?} does not track any upstream branch")]
    NoBranchMerge(String),

    /// Path given for upload has no file name.
    #[error("{:?} is not a file", .0.display())]
    NotAFile(PathBuf),

    /// New sources file entry would mix hash types.
    #[error(
        "cannot upload a new source file with a {new} hash, as the {sources:?} file contains \
         at least one line with a {existing} hash\n\nplease redo the whole {sources:?} file \
         using:\n    `rpkg new-sources file1 file2 ...`"
    )]
    HashtypeMixing {
        existing: String,
        new: String,
        sources: PathBuf,
    },

    /// Output directory cannot be created.
    #[error("failed to create output directory {:?}", path.display())]
    CreateOutdir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Sources file handling fails.
    #[error(transparent)]
    Sources(#[from] SourcesError),

    /// Gitignore file handling fails.
    #[error(transparent)]
    GitIgnore(#[from] GitIgnoreError),

    /// Hashing a local file fails.
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Lookaside cache transfer fails.
    #[error(transparent)]
    Lookaside(#[from] LookasideError),

    /// Glob pattern is invalid.
    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;
