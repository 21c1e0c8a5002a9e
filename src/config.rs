// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of Rpkg's configuration file to simplify the process of
//! serialization and deserialization. File I/O is mostly left to the caller,
//! apart from the [`Config::load`] convenience.

use crate::{
    lookaside::{LookasideCache, PathTemplate, DEFAULT_PATH_TEMPLATE},
    sources::EntryFormat,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Rpkg configuration layout.
///
/// # General Layout
///
/// The configuration is composed of three sections. The lookaside section
/// details how to reach the lookaside cache. The sources section details how
/// the sources file should be written. The package section can override the
/// identity of the package that the working copy holds.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Lookaside cache settings.
    pub lookaside: LookasideSettings,

    /// Sources file settings.
    pub sources: SourcesSettings,

    /// Package identity settings.
    pub package: PackageSettings,
}

impl Config {
    /// Load configuration from target path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadConfig`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    /// - Return [`ConfigError::ShellExpansion`] if a certificate path cannot
    ///   be expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_to_string(path.as_ref())
            .map_err(|err| ConfigError::ReadConfig {
                source: err.into(),
                path: path.as_ref().to_path_buf(),
            })?
            .parse()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on certificate paths.
        config.lookaside.client_cert = config
            .lookaside
            .client_cert
            .map(|path| expand_path(&path))
            .transpose()?;
        config.lookaside.ca_cert = config
            .lookaside
            .ca_cert
            .map(|path| expand_path(&path))
            .transpose()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Lookaside cache settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LookasideSettings {
    /// Hash algorithm to use for new uploads.
    pub hashtype: String,

    /// Base URL that source files are downloaded from.
    pub download_url: String,

    /// URL of CGI script that handles uploads.
    pub upload_url: String,

    /// Client-side certificate for HTTPS authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,

    /// CA certificate to trust for HTTPS connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Layout of download URLs relative to download URL.
    pub path_template: String,

    /// Send package name as `namespace/name`.
    pub namespaced: bool,

    /// Extra path template fields derived from the working copy.
    pub request_params: Vec<RequestParam>,
}

impl Default for LookasideSettings {
    fn default() -> Self {
        Self {
            hashtype: "md5".into(),
            download_url: String::new(),
            upload_url: String::new(),
            client_cert: None,
            ca_cert: None,
            path_template: DEFAULT_PATH_TEMPLATE.into(),
            namespaced: false,
            request_params: Vec::new(),
        }
    }
}

impl From<&LookasideSettings> for LookasideCache {
    fn from(settings: &LookasideSettings) -> Self {
        let mut cache = LookasideCache::new(
            &settings.hashtype,
            settings.download_url.as_str(),
            settings.upload_url.as_str(),
        )
        .with_path_template(PathTemplate::new(settings.path_template.as_str()));

        if let Some(path) = &settings.client_cert {
            cache = cache.with_client_cert(path);
        }

        if let Some(path) = &settings.ca_cert {
            cache = cache.with_ca_cert(path);
        }

        cache
    }
}

/// Path template field resolved from the working copy.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestParam {
    /// Upstream branch that the current branch merges from.
    Branch,
}

/// Sources file settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourcesSettings {
    /// Format of entries written to the sources file.
    pub entry_format: EntryFormat,
}

/// Package identity settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackageSettings {
    /// Name of package. Defaults to the working copy directory name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of package, e.g., "rpms".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    ReadConfig {
        #[source]
        source: std::sync::Arc<std::io::Error>,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
