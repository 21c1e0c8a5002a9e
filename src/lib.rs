// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package source management through a lookaside cache.
//!
//! Rpkg keeps the large source archives of a package out of its Git
//! repository. The working copy only carries a __sources file__ listing each
//! archive with its digest, while the archives themselves live in a
//! __lookaside cache__, a content-addressed store reached over HTTP(S).
//!
//! # Layout
//!
//! - [`hash`]: digest computation and verification of local files.
//! - [`sources`]: sources file parsing and rewriting.
//! - [`gitignore`]: keeps `.gitignore` in sync with the sources file.
//! - [`lookaside`]: existence check, upload, and download against the cache.
//! - [`repo`]: ties the above together for a package working copy.
//! - [`config`]: configuration file layout.
//!
//! # See Also
//!
//! 1. [Fedora - Package Source Control](https://docs.fedoraproject.org/en-US/package-maintainers/Package_Maintenance_Guide/)

pub mod config;
pub mod gitignore;
pub mod hash;
pub mod lookaside;
pub mod path;
pub mod repo;
pub mod sources;
