//! edsync CLI
//!
//! Command-line interface for synchronizing editor configuration with a
//! remote gist.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{Confirm, Input};
use is_terminal::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use edsync::config::SyncingConfig;
use edsync::extensions::{DirExtensionHost, VsixInstaller, metadata::MarketplaceClient};
use edsync::gist::{GistClient, RemoteStorage};
use edsync::orchestrator::{Confirmer, SyncOrchestrator, SyncOutcome, SyncSummary};
use edsync::watcher::ChangeWatcher;
use edsync::{Environment, SyncError};

#[derive(Parser)]
#[command(name = "edsync")]
#[command(author, version, about = "Sync editor settings through a remote gist")]
#[command(propagate_version = true)]
struct Cli {
    /// User configuration directory (holds settings.json)
    #[arg(long, env = "EDSYNC_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Installed extensions directory
    #[arg(long, env = "EDSYNC_EXTENSIONS_DIR", global = true)]
    extensions_dir: Option<PathBuf>,

    /// Editor host version, used for extension compatibility checks
    #[arg(long, env = "EDSYNC_EDITOR_VERSION", default_value = "1.90.0", global = true)]
    editor_version: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the remote token and pick or create a collection
    Init,

    /// Upload local settings to the remote collection
    Upload {
        /// Answer yes to the overwrite confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Download remote settings and apply them locally
    Download {
        /// Answer yes to the overwrite confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Watch for local changes and upload automatically
    Watch {
        /// Debounce window in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,
    },

    /// Show the configured collection and last sync revisions
    Status,
}

struct PromptConfirmer {
    assume_yes: bool,
}

impl Confirmer for PromptConfirmer {
    fn confirm(&self, change_count: usize) -> bool {
        if self.assume_yes {
            return true;
        }
        if !std::io::stdin().is_terminal() {
            eprintln!(
                "{} {} structural changes detected; re-run with --yes to proceed",
                "✘".red(),
                change_count
            );
            return false;
        }
        Confirm::new()
            .with_prompt(format!(
                "{} structural changes detected. Overwrite anyway?",
                change_count
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

fn resolve_env(cli: &Cli) -> Result<Environment> {
    let config_dir = cli
        .config_dir
        .clone()
        .context("no config directory; pass --config-dir or set EDSYNC_CONFIG_DIR")?;
    let extensions_dir = cli
        .extensions_dir
        .clone()
        .unwrap_or_else(|| config_dir.join("extensions"));
    Ok(Environment::new(config_dir, extensions_dir, cli.editor_version.clone()))
}

fn build_orchestrator(
    env: &Environment,
    config: &SyncingConfig,
    assume_yes: bool,
) -> Result<
    SyncOrchestrator<GistClient, VsixInstaller, MarketplaceClient, DirExtensionHost, PromptConfirmer>,
> {
    let proxy = config.proxy_url.as_deref();
    let remote = GistClient::new(config.remote_token.clone(), proxy)?;
    let installer = VsixInstaller::new(env.clone(), proxy)?;
    let metadata = MarketplaceClient::new(proxy)?;
    let host = DirExtensionHost::new(env.extensions_root());
    Ok(SyncOrchestrator::new(
        env.clone(),
        remote,
        installer,
        metadata,
        host,
        PromptConfirmer { assume_yes },
    ))
}

fn print_summary(direction: &str, summary: &SyncSummary) {
    println!("\n{}", format!("✨ {} complete!", direction).green().bold());
    println!(
        "  Saved: {}, Deleted: {}, Unchanged: {}, Load errors: {}",
        summary.saved.len().to_string().green(),
        summary.deleted.len().to_string().yellow(),
        summary.skipped.len().to_string().dimmed(),
        if summary.load_errors.is_empty() {
            summary.load_errors.len().to_string().dimmed()
        } else {
            summary.load_errors.len().to_string().red()
        }
    );
    for name in &summary.load_errors {
        eprintln!("  {} could not load {}", "✘".red(), name);
    }
    if let Some(ext) = &summary.extensions {
        println!(
            "  Extensions: +{} ~{} -{}{}",
            ext.added.succeeded.len().to_string().green(),
            ext.updated.succeeded.len().to_string().yellow(),
            ext.removed.succeeded.len().to_string().red(),
            if ext.failures() > 0 {
                format!(" ({} failed)", ext.failures()).red().to_string()
            } else {
                String::new()
            }
        );
    }
    if let Some(revision) = summary.revision {
        println!("  Revision: {}", revision.to_rfc3339().dimmed());
    }
}

fn report(direction: &str, outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(summary) => print_summary(direction, &summary),
        SyncOutcome::Aborted => {
            println!("{}", format!("○ {} aborted by user", direction).yellow());
        }
        SyncOutcome::AlreadyInFlight => {
            println!("{}", "○ a sync is already running".yellow());
        }
    }
}

async fn cmd_init(env: &Environment) -> Result<()> {
    let syncing_file = env.syncing_file();
    let mut config = SyncingConfig::load(&syncing_file)?;

    let token: String = Input::new()
        .with_prompt("Remote access token")
        .allow_empty(false)
        .interact_text()?;
    config.remote_token = Some(token.trim().to_string());

    let client = GistClient::new(config.remote_token.clone(), config.proxy_url.as_deref())?;
    match client.list_all().await {
        Ok(snapshots) if !snapshots.is_empty() => {
            println!("Existing settings collections:");
            for s in &snapshots {
                println!("  {} ({})", s.id.cyan(), s.updated_at.to_rfc3339().dimmed());
            }
            // Newest last; offer it as the default.
            let newest = &snapshots[snapshots.len() - 1];
            let use_it = Confirm::new()
                .with_prompt(format!("Use {}?", newest.id))
                .default(true)
                .interact()?;
            if use_it {
                config.remote_collection_id = Some(newest.id.clone());
            }
        }
        Ok(_) => {
            println!("No existing collection found; one will be created on first upload.");
        }
        Err(SyncError::Unauthorized) => bail!("the token was rejected; check its gist scope"),
        Err(e) => return Err(e.into()),
    }

    config.save(&syncing_file)?;
    println!("{}", "✨ Configuration saved".green().bold());
    Ok(())
}

fn cmd_status(env: &Environment) -> Result<()> {
    let config = SyncingConfig::load(&env.syncing_file())?;
    println!(
        "Collection: {}",
        config
            .remote_collection_id
            .as_deref()
            .unwrap_or("(not configured)")
            .cyan()
    );
    println!(
        "Token: {}",
        if config.remote_token.is_some() {
            "stored".green()
        } else {
            "missing".red()
        }
    );
    println!(
        "Last uploaded:   {}",
        config.last_uploaded.as_deref().unwrap_or("never").dimmed()
    );
    println!(
        "Last downloaded: {}",
        config.last_downloaded.as_deref().unwrap_or("never").dimmed()
    );
    println!("Gate threshold:  {}", config.exclusion_threshold);

    let locals = edsync::setting::gather_local(env, &config);
    println!("\nLocal settings:");
    for setting in locals {
        let mark = if setting.local_path.exists() {
            "✔".green()
        } else {
            "○".dimmed()
        };
        println!("  {} {}", mark, setting.remote_name);
    }
    Ok(())
}

async fn cmd_watch(env: &Environment, debounce_ms: Option<u64>) -> Result<()> {
    let config = SyncingConfig::load(&env.syncing_file())?;
    let orchestrator = build_orchestrator(env, &config, true)?;
    let mut watcher = ChangeWatcher::new(
        env,
        debounce_ms.map(std::time::Duration::from_millis),
    )?;
    println!(
        "{}",
        format!("➤ Watching {}", env.config_root().display()).cyan().bold()
    );

    while watcher.recv().await.is_some() {
        // Our own writes must not retrigger the watcher.
        watcher.pause();
        match orchestrator.upload().await {
            Ok(outcome) => report("Upload", outcome),
            Err(e) => eprintln!("{} upload failed: {}", "✘".red(), e),
        }
        watcher.resume();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = resolve_env(&cli)?;

    match &cli.command {
        Commands::Init => cmd_init(&env).await?,
        Commands::Upload { yes } => {
            let config = SyncingConfig::load(&env.syncing_file())?;
            let orchestrator = build_orchestrator(&env, &config, *yes)?;
            println!("{}", "➤ Uploading settings".cyan().bold());
            match orchestrator.upload().await {
                Ok(outcome) => report("Upload", outcome),
                Err(e) => bail!("upload failed: {}", e),
            }
        }
        Commands::Download { yes } => {
            let config = SyncingConfig::load(&env.syncing_file())?;
            let orchestrator = build_orchestrator(&env, &config, *yes)?;
            println!("{}", "➤ Downloading settings".cyan().bold());
            match orchestrator.download().await {
                Ok(outcome) => report("Download", outcome),
                Err(e) => bail!("download failed: {}", e),
            }
        }
        Commands::Watch { debounce_ms } => cmd_watch(&env, *debounce_ms).await?,
        Commands::Status => cmd_status(&env)?,
    }
    Ok(())
}
