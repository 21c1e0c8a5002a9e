// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transfer progress reporting.
//!
//! Downloads and uploads report progress through one callback shape taking
//! four numbers: bytes to download, bytes downloaded, bytes to upload, and
//! bytes uploaded. A download leaves the upload pair at zero, and vice versa.
//! Thus, a single renderer serves both directions.

use indicatif::{style::TemplateError, ProgressBar, ProgressStyle};
use std::sync::Arc;

/// Progress callback.
///
/// Called as `progress(to_download, downloaded, to_upload, uploaded)`.
pub type Progress = Arc<dyn Fn(u64, u64, u64, u64) + Send + Sync>;

/// Build progress callback that drives a progress bar.
///
/// The bar restarts whenever a transfer of a different size begins, so one
/// bar can be reused across a whole batch of files. Nothing is drawn when the
/// bar is not attached to a terminal.
///
/// # Errors
///
/// - Return [`TemplateError`] if progress bar style cannot be set.
pub fn progress_bar(bar: ProgressBar) -> Result<Progress, TemplateError> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {bytes:>10}/{total_bytes:<10}  [{wide_bar:.yellow/blue}] {percent}%",
    )?
    .progress_chars("#>-");
    bar.set_style(style);

    Ok(Arc::new(move |to_download, downloaded, to_upload, uploaded| {
        let (total, done) = match (to_download, to_upload) {
            (0, 0) => return,
            (0, _) => (to_upload, uploaded),
            _ => (to_download, downloaded),
        };

        if bar.length() != Some(total) {
            bar.reset();
            bar.set_length(total);
        }
        bar.set_position(done);
    }))
}
