// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Lookaside cache client.
//!
//! The __lookaside cache__ is a content-addressed store of large source
//! archives that sits next to a package's Git repository. Files are uploaded
//! through a CGI script, and downloaded from a static tree whose layout is
//! described by a [`PathTemplate`].
//!
//! # Protocol
//!
//! - __Existence check__: POST form fields `name`, `<hashtype>sum`, and
//!   `filename` to the CGI script. The server answers with a body of exactly
//!   `Available` or `Missing`. Anything else is an error.
//! - __Upload__: POST form fields `name`, `<hashtype>sum`, and `file` (the
//!   file contents) to the CGI script. Upload only happens after an existence
//!   check reported the file missing.
//! - __Download__: GET `<download_url>/<expanded path template>`. The body is
//!   streamed straight to the output file, and verified against the expected
//!   digest once complete.
//!
//! Every operation is a fresh round trip. Nothing here touches the sources
//! file. Registering entries is left to the caller, after the transfer
//! succeeded.

pub mod progress;

use crate::{
    hash::{file_is_valid, HashError, HashType},
    lookaside::progress::Progress,
    sources::SourceEntry,
};

use chrono::DateTime;
use futures::StreamExt;
use reqwest::{
    header::LAST_MODIFIED,
    multipart::{Form, Part},
    Body, Certificate, Client, Identity, Response, StatusCode,
};
use std::{
    collections::BTreeMap,
    fs::{read, remove_file},
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Default layout of download URLs.
pub const DEFAULT_PATH_TEMPLATE: &str = "%(name)s/%(filename)s/%(hash)s/%(filename)s";

/// Transfers slower than this many bytes per second for too long get aborted.
pub const DEFAULT_LOW_SPEED_LIMIT: u64 = 1000;

/// How long a transfer may stay below the low speed limit.
pub const DEFAULT_LOW_SPEED_TIME: Duration = Duration::from_secs(300);

/// Extra fields made available to the path template.
pub type TemplateFields = BTreeMap<String, String>;

/// Client of a CGI-based lookaside cache.
#[derive(Debug, Clone)]
pub struct LookasideCache {
    hashtype: String,
    download_url: String,
    upload_url: String,
    client_cert: Option<PathBuf>,
    ca_cert: Option<PathBuf>,
    path_template: PathTemplate,
    low_speed_limit: u64,
    low_speed_time: Duration,
}

impl LookasideCache {
    /// Construct new lookaside cache client.
    ///
    /// Hash type is only used for uploads and existence checks. Downloads use
    /// whatever hash type their source entry names.
    pub fn new(
        hashtype: impl AsRef<str>,
        download_url: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            hashtype: hashtype.as_ref().to_lowercase(),
            download_url: download_url.into(),
            upload_url: upload_url.into(),
            client_cert: None,
            ca_cert: None,
            path_template: PathTemplate::default(),
            low_speed_limit: DEFAULT_LOW_SPEED_LIMIT,
            low_speed_time: DEFAULT_LOW_SPEED_TIME,
        }
    }

    /// Use client-side certificate for HTTPS authentication.
    pub fn with_client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(path.into());
        self
    }

    /// Trust CA certificate for HTTPS connections.
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    /// Use custom layout for download URLs.
    pub fn with_path_template(mut self, template: PathTemplate) -> Self {
        self.path_template = template;
        self
    }

    /// Abort downloads that average below `limit` bytes per second over
    /// `time`.
    pub fn with_low_speed_limit(mut self, limit: u64, time: Duration) -> Self {
        self.low_speed_limit = limit;
        self.low_speed_time = time;
        self
    }

    /// Hash type used for uploads.
    pub fn hashtype(&self) -> &str {
        &self.hashtype
    }

    /// Build full download URL of a source entry.
    ///
    /// # Errors
    ///
    /// - Return [`LookasideError::PathTemplate`] if template names an unknown
    ///   field.
    /// - Return [`LookasideError::Download`] if result is not a valid URL.
    pub fn download_url(
        &self,
        name: &str,
        entry: &SourceEntry,
        extra: &TemplateFields,
    ) -> Result<Url> {
        let mut fields = TemplateFields::new();
        fields.insert("name".into(), name.into());
        fields.insert("filename".into(), entry.file().replace(' ', "%20"));
        fields.insert("hash".into(), entry.hash().into());
        fields.insert("hashtype".into(), entry.hashtype().into());
        fields.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));

        let path = self.path_template.expand(&fields)?;
        let url = format!("{}/{}", self.download_url, path);
        Url::parse(&url).map_err(|err| LookasideError::Download {
            file: entry.file().into(),
            message: format!("invalid URL {url:?}: {err}"),
            status: None,
        })
    }

    /// Download a source file.
    ///
    /// Does nothing if `outfile` already exists with the expected digest.
    /// Otherwise, streams the file from the cache into `outfile`, stamps it
    /// with the server's modification time, and verifies it.
    ///
    /// # Invariant
    ///
    /// - Entry's hash type is resolved before any network traffic.
    /// - Entry's file name must be a plain base name.
    /// - On failure, no file is left at `outfile`.
    ///
    /// # Errors
    ///
    /// - Return [`LookasideError::Hash`] if entry's hash type is unknown, or
    ///   existing file cannot be read.
    /// - Return [`LookasideError::Download`] if entry's file name is not a
    ///   base name, transfer fails or stalls, the server responds with
    ///   anything but 200, or downloaded content fails its checksum.
    #[instrument(skip(self, entry, outfile, extra, progress), fields(file = entry.file()), level = "debug")]
    pub async fn download(
        &self,
        name: &str,
        entry: &SourceEntry,
        outfile: impl AsRef<Path>,
        extra: &TemplateFields,
        progress: Option<Progress>,
    ) -> Result<()> {
        let outfile = outfile.as_ref();
        entry.hashtype().parse::<HashType>().map_err(HashError::from)?;
        if !is_base_name(entry.file()) {
            return Err(LookasideError::Download {
                file: entry.file().into(),
                message: "file name must not contain path components".into(),
                status: None,
            });
        }

        if outfile.exists() && file_is_valid(outfile, entry.hash(), entry.hashtype())? {
            debug!("{:?} already downloaded", outfile.display());
            return Ok(());
        }

        // INVARIANT: Whatever sits at outfile from here on is invalid or partial.
        let result = self.fetch(name, entry, outfile, extra, progress).await;
        if result.is_err() {
            discard(outfile);
        }

        result
    }

    /// Check whether a file exists in the lookaside cache.
    ///
    /// # Errors
    ///
    /// - Return [`LookasideError::Upload`] if request fails, the server
    ///   responds with anything but 200, or the response is neither
    ///   "Available" nor "Missing".
    #[instrument(skip(self, hash), level = "debug")]
    pub async fn remote_file_exists(&self, name: &str, filename: &str, hash: &str) -> Result<bool> {
        let form = Form::new()
            .text("name", name.to_string())
            .text(format!("{}sum", self.hashtype), hash.to_string())
            .text("filename", filename.to_string());

        let (status, output) = self.post_form(form).await?;
        if status != StatusCode::OK {
            return Err(upload_error(status));
        }

        match output.as_str() {
            "Available" => Ok(true),
            "Missing" => Ok(false),
            _ => {
                debug!("{output}");
                Err(LookasideError::Upload {
                    message: format!("error checking for {filename} at {}", self.upload_url),
                    status: Some(status),
                })
            }
        }
    }

    /// Upload a source file.
    ///
    /// Does nothing if the lookaside cache already has the file.
    ///
    /// # Errors
    ///
    /// - Return [`LookasideError::Upload`] if existence check fails, the file
    ///   cannot be read, the request fails, or the server responds with
    ///   anything but 200.
    #[instrument(skip(self, filepath, hash, progress), level = "debug")]
    pub async fn upload(
        &self,
        name: &str,
        filepath: impl AsRef<Path>,
        hash: &str,
        progress: Option<Progress>,
    ) -> Result<()> {
        let filepath = filepath.as_ref();
        let filename = filepath
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.remote_file_exists(name, &filename, hash).await? {
            info!("file already uploaded: {}", filepath.display());
            return Ok(());
        }

        info!("uploading: {}", filepath.display());
        let read_err = |err: std::io::Error| LookasideError::Upload {
            message: format!("failed to read {}: {err}", filepath.display()),
            status: None,
        };
        let file = File::open(filepath).await.map_err(read_err)?;
        let total = file.metadata().await.map_err(read_err)?.len();

        let mut uploaded = 0u64;
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let (Ok(bytes), Some(progress)) = (chunk, &progress) {
                uploaded += bytes.len() as u64;
                progress(0, 0, total, uploaded);
            }
        });
        let part = Part::stream_with_length(Body::wrap_stream(stream), total).file_name(filename);
        let form = Form::new()
            .text("name", name.to_string())
            .text(format!("{}sum", self.hashtype), hash.to_string())
            .part("file", part);

        let (status, output) = self.post_form(form).await?;
        if status != StatusCode::OK {
            return Err(upload_error(status));
        }

        if !output.is_empty() {
            debug!("{output}");
        }

        Ok(())
    }

    async fn fetch(
        &self,
        name: &str,
        entry: &SourceEntry,
        outfile: &Path,
        extra: &TemplateFields,
        progress: Option<Progress>,
    ) -> Result<()> {
        let download_err = |message: String, status: Option<StatusCode>| LookasideError::Download {
            file: entry.file().into(),
            message,
            status,
        };

        info!("downloading {}", entry.file());
        let url = self.download_url(name, entry, extra)?;
        debug!("full url: {url}");

        let client = self.http_client()?;
        let send = client.get(url).send();
        let response = match tokio::time::timeout(self.low_speed_time, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(download_err(err.to_string(), None)),
            Err(_) => {
                let stall = StallDetector::new(self.low_speed_limit, self.low_speed_time);
                return Err(download_err(stall.message(), None));
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Err(download_err(
                format!("server returned status code {}", status.as_u16()),
                Some(status),
            ));
        }

        self.stream_to_file(response, outfile, progress)
            .await
            .map_err(|message| download_err(message, Some(status)))?;

        if !file_is_valid(outfile, entry.hash(), entry.hashtype())? {
            return Err(download_err("failed checksum".into(), Some(status)));
        }

        Ok(())
    }

    async fn post_form(&self, form: Form) -> Result<(StatusCode, String)> {
        let transport_err = |err: reqwest::Error| LookasideError::Upload {
            message: err.to_string(),
            status: None,
        };

        let response = self
            .http_client()?
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(transport_err)?;
        let status = response.status();
        let output = response.text().await.map_err(transport_err)?;

        Ok((status, output.trim().to_string()))
    }

    async fn stream_to_file(
        &self,
        response: Response,
        outfile: &Path,
        progress: Option<Progress>,
    ) -> std::result::Result<(), String> {
        let mtime = last_modified(&response);
        let total = response.content_length().unwrap_or(0);
        let mut file = File::create(outfile).await.map_err(|err| err.to_string())?;
        let mut body = response.bytes_stream();
        let mut stall = StallDetector::new(self.low_speed_limit, self.low_speed_time);
        let mut downloaded = 0u64;

        loop {
            let chunk = match tokio::time::timeout(self.low_speed_time, body.next()).await {
                Ok(Some(chunk)) => chunk.map_err(|err| err.to_string())?,
                Ok(None) => break,
                Err(_) => return Err(stall.message()),
            };

            file.write_all(&chunk).await.map_err(|err| err.to_string())?;
            downloaded += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(total, downloaded, 0, 0);
            }

            if stall.record(chunk.len() as u64) {
                return Err(stall.message());
            }
        }

        file.flush().await.map_err(|err| err.to_string())?;
        let file = file.into_std().await;
        if let Some(mtime) = mtime {
            file.set_modified(mtime).map_err(|err| err.to_string())?;
        }

        Ok(())
    }

    fn http_client(&self) -> Result<Client> {
        let mut builder = Client::builder();

        if let Some(path) = present(self.client_cert.as_deref()) {
            let pem = read_cert(path)?;
            let identity = Identity::from_pem(&pem).map_err(|err| cert_error(path, err))?;
            builder = builder.identity(identity);
        }

        if let Some(path) = present(self.ca_cert.as_deref()) {
            let pem = read_cert(path)?;
            let cert = Certificate::from_pem(&pem).map_err(|err| cert_error(path, err))?;
            builder = builder.add_root_certificate(cert);
        }

        builder.build().map_err(LookasideError::Client)
    }
}

// Missing certificates are not fatal, some caches are open to anyone.
fn present(path: Option<&Path>) -> Option<&Path> {
    let path = path?;
    if path.exists() {
        Some(path)
    } else {
        warn!("missing certificate: {}", path.display());
        None
    }
}

fn read_cert(path: &Path) -> Result<Vec<u8>> {
    read(path).map_err(|err| cert_error(path, err))
}

fn cert_error(path: &Path, err: impl std::fmt::Display) -> LookasideError {
    LookasideError::Certificate {
        message: err.to_string(),
        path: path.to_path_buf(),
    }
}

fn last_modified(response: &Response) -> Option<SystemTime> {
    let value = response.headers().get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value).ok().map(SystemTime::from)
}

fn is_base_name(file: &str) -> bool {
    let mut components = Path::new(file).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn discard(outfile: &Path) {
    match remove_file(outfile) {
        Ok(()) => info!("removed invalid download {}", outfile.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {}: {err}", outfile.display()),
    }
}

fn upload_error(status: StatusCode) -> LookasideError {
    let message = match status {
        StatusCode::UNAUTHORIZED => "Request is unauthorized.".to_string(),
        StatusCode::INTERNAL_SERVER_ERROR => "Error occurs inside the server.".to_string(),
        _ => format!(
            "Fail to upload files. Server returns status {}",
            status.as_u16()
        ),
    };

    LookasideError::Upload {
        message,
        status: Some(status),
    }
}

/// Detect transfers that crawl below a speed floor.
#[derive(Debug)]
struct StallDetector {
    limit: u64,
    window: Duration,
    started: Instant,
    bytes: u64,
}

impl StallDetector {
    fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            started: Instant::now(),
            bytes: 0,
        }
    }

    /// Record received bytes. Returns true if the finished window averaged
    /// below the limit.
    fn record(&mut self, count: u64) -> bool {
        self.bytes += count;
        let elapsed = self.started.elapsed();
        if elapsed < self.window {
            return false;
        }

        let floor = self.limit as f64 * elapsed.as_secs_f64();
        let stalled = (self.bytes as f64) < floor;
        self.started = Instant::now();
        self.bytes = 0;

        stalled
    }

    fn message(&self) -> String {
        format!(
            "transfer slower than {} bytes/sec for {} seconds",
            self.limit,
            self.window.as_secs()
        )
    }
}

/// Layout of download URLs.
///
/// Uses printf-style named placeholders, e.g., `%(name)s/%(hash)s`. A `%%`
/// stands for a literal percent sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    /// Construct new path template.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Substitute fields into template.
    ///
    /// # Errors
    ///
    /// - Return [`LookasideError::PathTemplate`] if template names a field
    ///   that is not given, or a placeholder is not terminated.
    pub fn expand(&self, fields: &TemplateFields) -> Result<String> {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            rest = &rest[start + 1..];

            if let Some(after) = rest.strip_prefix('%') {
                out.push('%');
                rest = after;
                continue;
            }

            let (key, after) = rest
                .strip_prefix('(')
                .and_then(|inner| inner.split_once(")s"))
                .ok_or_else(|| {
                    LookasideError::PathTemplate(format!("bad placeholder in {:?}", self.0))
                })?;
            let value = fields
                .get(key)
                .ok_or_else(|| LookasideError::PathTemplate(format!("unknown field {key:?}")))?;
            out.push_str(value);
            rest = after;
        }
        out.push_str(rest);

        Ok(out)
    }

    /// Raw template text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_PATH_TEMPLATE)
    }
}

/// Lookaside cache error types.
#[derive(Debug, thiserror::Error)]
pub enum LookasideError {
    /// Hashing a local file fails.
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Path template cannot be expanded.
    #[error("invalid download path template: {0}")]
    PathTemplate(String),

    /// Certificate cannot be loaded.
    #[error("failed to load certificate {:?}: {message}", path.display())]
    Certificate { message: String, path: PathBuf },

    /// HTTP client cannot be constructed.
    #[error("failed to set up HTTP client")]
    Client(#[source] reqwest::Error),

    /// Download fails or produces bad content.
    #[error("failed to download {file:?}: {message}")]
    Download {
        file: String,
        message: String,
        status: Option<StatusCode>,
    },

    /// Upload or existence check fails.
    #[error("{message}")]
    Upload {
        message: String,
        status: Option<StatusCode>,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LookasideError> = std::result::Result<T, E>;
