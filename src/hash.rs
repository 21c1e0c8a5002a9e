// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content hashing of source files.
//!
//! Every source file tracked through the lookaside cache is identified by a
//! hex digest of its contents. This module provides the small registry of
//! hash algorithms that Rpkg understands, and the streaming file hasher that
//! the rest of the crate relies on to decide whether a file is "good".
//!
//! Hash algorithm names travel around as plain strings (they come from the
//! sources file and from configuration), and are only resolved against the
//! registry at the moment a digest actually needs to be computed. Thus, a
//! sources file naming an algorithm this build does not know about can still
//! be read and rewritten. It just cannot be verified.

use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

const CHUNK_SIZE: usize = 8192;

/// Hash algorithms known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashType {
    /// Lowercase identifier, e.g., "sha256".
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Md5 => Box::new(Md5::default()),
            Self::Sha1 => Box::new(Sha1::default()),
            Self::Sha224 => Box::new(Sha224::default()),
            Self::Sha256 => Box::new(Sha256::default()),
            Self::Sha384 => Box::new(Sha384::default()),
            Self::Sha512 => Box::new(Sha512::default()),
        }
    }
}

impl FromStr for HashType {
    type Err = InvalidHashType;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(InvalidHashType(name.into())),
        }
    }
}

impl Display for HashType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Compute hex digest of a file's contents.
///
/// Reads the file in fixed-size chunks, so large source archives are never
/// held in memory as a whole. The file handle is released on every return
/// path.
///
/// # Errors
///
/// - Return [`HashError::InvalidHashType`] if `hashtype` is not in the
///   registry.
/// - Return [`HashError::ReadFile`] if the file cannot be opened or read.
pub fn hash_file(path: impl AsRef<Path>, hashtype: impl AsRef<str>) -> Result<String> {
    let hashtype: HashType = hashtype.as_ref().parse()?;
    let path = path.as_ref();
    let read_err = |source| HashError::ReadFile {
        source,
        path: path.to_path_buf(),
    };

    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = hashtype.hasher();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let count = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_err(err)),
        };
        hasher.update(&buf[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check that a file's contents hash to an expected digest.
///
/// # Errors
///
/// - Return [`HashError::InvalidHashType`] if `hashtype` is not in the
///   registry.
/// - Return [`HashError::ReadFile`] if the file cannot be opened or read.
pub fn file_is_valid(
    path: impl AsRef<Path>,
    expected: impl AsRef<str>,
    hashtype: impl AsRef<str>,
) -> Result<bool> {
    Ok(hash_file(path, hashtype)? == expected.as_ref())
}

/// Requested hash algorithm is not part of the registry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid hash type {0:?}")]
pub struct InvalidHashType(pub String);

/// Hashing error types.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Unknown hash algorithm.
    #[error(transparent)]
    InvalidHashType(#[from] InvalidHashType),

    /// Target file cannot be read.
    #[error("failed to read {:?} for hashing", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = HashError> = std::result::Result<T, E>;
