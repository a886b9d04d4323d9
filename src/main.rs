//! upload-drive CLI - Upload a file or directory to Google Drive.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use drive_upload::auth::{export_hint, generate_token_file, TokenOrigin};
use drive_upload::credentials::{
    resolve_credentials_path, TokenArg, TokenSource, CREDENTIALS_ENV, TOKEN_ENV, TOKEN_FILENAME,
};
use drive_upload::flow::is_headless;
use drive_upload::models::{format_eta, format_size};
use drive_upload::{source, Authenticator, DriveClient, DriveError, PreparedSource};

/// Upload a file or directory to Google Drive.
#[derive(Parser)]
#[command(name = "upload-drive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the file or directory to upload.
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Path to the Google OAuth credentials.json file.
    #[arg(short, long, env = CREDENTIALS_ENV)]
    credentials: Option<PathBuf>,

    /// Token handling: 'generate' to create token.json, path to a token.json
    /// file, or raw token JSON. When given, --credentials is ignored (except
    /// for 'generate').
    #[arg(short, long, env = TOKEN_ENV)]
    token: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    // Dropping the run future on Ctrl-C removes any temporary archive.
    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("Interrupted")),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "drive_upload=debug,upload_drive=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let token_arg = cli.token.as_deref().map(TokenArg::parse);

    if token_arg == Some(TokenArg::Generate) {
        return generate(cli.credentials).await;
    }

    let source = cli.source.ok_or_else(|| {
        anyhow!(
            "--source is required for upload operations.\n\
             Use --token generate to create a token.json file."
        )
    })?;

    // Checked before authenticating so a typo never triggers a consent prompt.
    if !source.exists() {
        return Err(DriveError::SourceNotFound(source).into());
    }

    let auth = match token_arg {
        Some(TokenArg::Provided(token_source)) => {
            match &token_source {
                TokenSource::File(path) => eprintln!("Using token from file: {}", path.display()),
                TokenSource::Literal(_) => eprintln!("Using provided token."),
            }
            Authenticator::from_token_source(&token_source)
                .await
                .context("Failed to load token")?
        }
        _ => {
            let credentials_path = resolve_credentials_path(cli.credentials)?;
            let auth = Authenticator::from_credentials_file(&credentials_path)
                .await
                .with_context(|| {
                    format!("Failed to authenticate with {:?}", credentials_path)
                })?;
            if auth.origin() == TokenOrigin::Authorized && is_headless() {
                print_headless_hint(&auth).await?;
            }
            auth
        }
    };

    let client = DriveClient::new(auth)?;
    upload(&client, &source).await
}

async fn upload(client: &DriveClient, path: &Path) -> Result<()> {
    let prepared = prepare_source(path).await?;

    if prepared.is_archive() {
        println!("Directory detected. Zipped {} as {}", path.display(), prepared.name());
    }
    println!(
        "Uploading {} ({}, {})...",
        prepared.name(),
        prepared.mime_type(),
        format_size(std::fs::metadata(prepared.path())?.len())
    );

    let mut progress = Progress::new();
    let result = client
        .upload(&prepared, |done, total| progress.update(done, total))
        .await;
    println!();

    let archive_path = prepared.is_archive().then(|| prepared.path().to_path_buf());
    match prepared.cleanup() {
        Ok(()) => {
            if let Some(path) = archive_path {
                println!("Cleaned up temporary zip: {}", path.display());
            }
        }
        Err(e) => warn!(error = %e, "Failed to remove temporary zip"),
    }

    let metadata = result.context("Upload failed")?;
    println!("Upload complete - File ID: {}", metadata.id);
    if let Some(link) = &metadata.web_view_link {
        println!("Link: {}", link);
    }

    Ok(())
}

/// Package `path` on the blocking thread pool.
async fn prepare_source(path: &Path) -> Result<PreparedSource> {
    let owned = path.to_path_buf();
    let prepared = tokio::task::spawn_blocking(move || source::prepare(owned))
        .await
        .context("Packaging task failed")?
        .with_context(|| format!("Failed to prepare {:?}", path))?;
    Ok(prepared)
}

async fn generate(credentials: Option<PathBuf>) -> Result<()> {
    let credentials_path = resolve_credentials_path(credentials)?;

    eprintln!("Generating OAuth token...");
    let auth = generate_token_file(&credentials_path, TOKEN_FILENAME)
        .await
        .context("Failed to generate token")?;

    if auth.origin() == TokenOrigin::Authorized && is_headless() {
        print_headless_hint(&auth).await?;
    }

    eprintln!("\nToken saved to {}", TOKEN_FILENAME);
    eprintln!("This file contains your access token and can be reused on headless servers.");
    eprintln!("Usage: upload-drive -s <file> -t {}", TOKEN_FILENAME);
    Ok(())
}

async fn print_headless_hint(auth: &Authenticator) -> Result<()> {
    let hint = export_hint(&auth.token().await)?;
    eprintln!("\n{}", "=".repeat(50));
    eprintln!("AUTHENTICATION SUCCESSFUL!");
    eprintln!();
    eprintln!("For future use on headless servers, set this environment variable:");
    eprintln!("{}", hint);
    eprintln!("{}", "=".repeat(50));
    Ok(())
}

/// Single-line progress display on stdout.
struct Progress {
    started: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn update(&mut self, done: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (done as f64 / total as f64 * 100.0) as u64
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let eta = if done == 0 || elapsed <= 0.0 {
            f64::INFINITY
        } else {
            (total - done.min(total)) as f64 / (done as f64 / elapsed)
        };

        print!(
            "\r  Progress: {}% ({} / {}, ETA {})   ",
            percent,
            format_size(done),
            format_size(total),
            format_eta(eta)
        );
        let _ = std::io::stdout().flush();
    }
}
