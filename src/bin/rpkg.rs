// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use rpkg::{
    config::Config,
    lookaside::progress::{progress_bar, Progress},
    path::default_config_path,
    repo::{FileStatus, PackageRepo},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  rpkg [options] <rpkg-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to package working copy.
    #[arg(long, global = true, value_name = "dir", default_value = ".")]
    pub path: PathBuf,

    /// Show debug output.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only show warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = load_config(self.config.as_ref())?;
        let repo = PackageRepo::open(&self.path, config)
            .with_context(|| format!("failed to open package at {:?}", self.path.display()))?;

        match self.command {
            Command::Sources(opts) => run_sources(&repo, opts).await,
            Command::Upload(opts) => run_upload(&repo, opts.files, false).await,
            Command::NewSources(opts) => run_upload(&repo, opts.files, true).await,
            Command::UntrackedPatches => run_untracked_patches(&repo),
            Command::CheckSources(opts) => run_check_sources(&repo, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Download source files listed in sources file.
    #[command(override_usage = "rpkg sources [options]")]
    Sources(SourcesOptions),

    /// Upload source files and add them to sources file.
    #[command(override_usage = "rpkg upload [options] <file>...")]
    Upload(UploadOptions),

    /// Upload source files and replace sources file with them.
    #[command(override_usage = "rpkg new-sources [options] <file>...")]
    NewSources(UploadOptions),

    /// List patches tracked by neither Git nor sources file.
    #[command(override_usage = "rpkg untracked-patches [options]")]
    UntrackedPatches,

    /// Verify local source files against sources file.
    #[command(override_usage = "rpkg check-sources [options]")]
    CheckSources(CheckOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SourcesOptions {
    /// Directory to download source files into.
    #[arg(long, value_name = "dir")]
    pub outdir: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UploadOptions {
    /// Source files to upload.
    #[arg(required = true, value_name = "file")]
    pub files: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CheckOptions {
    /// Directory holding source files.
    #[arg(long, value_name = "dir")]
    pub dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path.clone(),
        None => {
            let path = default_config_path()?;
            if !path.exists() {
                warn!("no configuration at {:?}, using defaults", path.display());
                return Ok(Config::default());
            }
            path
        }
    };

    Ok(Config::load(path)?)
}

fn new_progress() -> Result<(ProgressBar, Progress)> {
    let bar = ProgressBar::new(0);
    let progress = progress_bar(bar.clone())?;
    Ok((bar, progress))
}

async fn run_sources(repo: &PackageRepo, opts: SourcesOptions) -> Result<()> {
    let (bar, progress) = new_progress()?;
    let result = repo.sources(opts.outdir.as_deref(), Some(progress)).await;
    bar.finish_and_clear();

    Ok(result?)
}

async fn run_upload(repo: &PackageRepo, files: Vec<PathBuf>, replace: bool) -> Result<()> {
    let (bar, progress) = new_progress()?;
    let result = repo.upload(&files, replace, Some(progress)).await;
    bar.finish_and_clear();
    result?;

    info!("source upload succeeded, don't forget to commit the sources file");
    Ok(())
}

fn run_untracked_patches(repo: &PackageRepo) -> Result<()> {
    let patches = repo.find_untracked_patches()?;
    if patches.is_empty() {
        info!("no untracked patches");
    }

    for patch in patches {
        println!("{patch}");
    }

    Ok(())
}

fn run_check_sources(repo: &PackageRepo, opts: CheckOptions) -> Result<()> {
    let mut failed = false;
    for (entry, status) in repo.check_sources(opts.dir.as_deref())? {
        println!("{}: {status}", entry.file());
        failed |= status != FileStatus::Valid;
    }

    if failed {
        anyhow::bail!("not all source files are valid");
    }

    Ok(())
}
