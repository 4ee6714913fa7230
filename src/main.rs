//! SaveSync CLI - Back up and restore launcher data to cloud storage
//!
//! Usage:
//!   savesync auth <provider>  - Configure a storage backend (Dropbox via browser login)
//!   savesync backup           - Upload what changed since the last backup
//!   savesync plan             - Compare local files with the backup
//!   savesync restore          - Download the backup back into place
//!   savesync status           - Show configuration and last backup

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use savesync::config::default_config_path;
use savesync::manifest::META_FILE;
use savesync::sync::oauth::PkceFlow;
use savesync::sync::{
    CredentialStore, DropboxParams, LocalParams, ProviderKind, S3Params, WebDavParams,
};
use savesync::{
    build_provider, execute_restore, plan_restore, run_backup, BackupGroup, BackupMeta,
    BackupMode, BackupOptions, Config, LibraryRescan, LocalContext, PathMatcher, ProgressEvent,
    ProgressSink, ProviderParams, RestoreDecision, RestoreOptions, SqliteDatabase, StorageProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// SaveSync - Backup for emulator saves and launcher data
#[derive(Parser)]
#[command(name = "savesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/savesync/savesync.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the storage backend and store its credentials
    Auth {
        #[command(subcommand)]
        target: AuthTarget,
    },

    /// Back up local files (incremental unless --full)
    Backup {
        /// Also delete remote files that no longer exist locally
        #[arg(long)]
        full: bool,

        /// Groups to back up: config, database, rms, emuConfig (default: all)
        #[arg(short, long = "group")]
        groups: Vec<BackupGroup>,
    },

    /// Show what a restore would overwrite
    Plan {
        #[arg(short, long = "group")]
        groups: Vec<BackupGroup>,
    },

    /// Restore files from the backup
    Restore {
        #[arg(short, long = "group")]
        groups: Vec<BackupGroup>,

        /// Only restore these manifest paths (exact, prefix* or directory)
        #[arg(short, long = "path")]
        paths: Vec<String>,

        /// Restore despite conflicts and re-download unchanged files
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and the last backup
    Status,
}

#[derive(Subcommand)]
enum AuthTarget {
    /// Dropbox via browser login (PKCE)
    Dropbox {
        /// Dropbox app key
        #[arg(long)]
        app_key: String,

        /// Loopback port for the OAuth redirect
        #[arg(long)]
        port: Option<u16>,
    },

    /// S3-compatible object storage
    S3 {
        #[arg(long)]
        bucket: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Custom endpoint (MinIO, R2, ...)
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, env = "AWS_ACCESS_KEY_ID")]
        access_key_id: String,
        #[arg(long, env = "AWS_SECRET_ACCESS_KEY")]
        secret_access_key: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// WebDAV server (Nextcloud, ownCloud, ...)
    Webdav {
        #[arg(long)]
        url: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "SAVESYNC_WEBDAV_PASSWORD", default_value = "")]
        password: String,
        #[arg(long, default_value = "SaveSync")]
        root: String,
    },

    /// Local or mounted directory
    Local {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("savesync={}", log_level).parse()?),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Auth { target } => cmd_auth(&config_path, target),
        Commands::Backup { full, groups } => cmd_backup(&config_path, full, groups),
        Commands::Plan { groups } => cmd_plan(&config_path, groups),
        Commands::Restore {
            groups,
            paths,
            force,
        } => cmd_restore(&config_path, groups, paths, force),
        Commands::Status => cmd_status(&config_path),
    }
}

// ============ SHARED ============

fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        Ok(Config::new())
    }
}

/// `credentials.json` lives next to the config file.
fn credentials_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("credentials.json")
}

fn selected_groups(groups: Vec<BackupGroup>) -> Vec<BackupGroup> {
    if groups.is_empty() {
        BackupGroup::ALL.to_vec()
    } else {
        groups
    }
}

fn open_provider(config: &Config, store: &CredentialStore) -> Result<Box<dyn StorageProvider>> {
    let Some(kind) = config.provider_kind()? else {
        bail!("No storage provider configured. Run 'savesync auth <provider>' first.");
    };
    let params = store
        .get(kind)
        .with_context(|| format!("No credentials stored for {}", kind))?;
    build_provider(params)
}

/// Store credentials rotated during the run (refreshed OAuth token).
fn persist_refreshed(provider: &dyn StorageProvider, store: &mut CredentialStore) -> Result<()> {
    if let Some(params) = provider.refreshed_params() {
        store.put(params);
        store.save()?;
    }
    Ok(())
}

/// Terminal progress output.
struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("  {spinner:.cyan} {msg}")?);
        bar.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::UploadProgress { path, percent } => {
                self.bar.set_message(format!("{} ({}%)", path, percent));
            }
            ProgressEvent::UploadDone { path } => {
                self.bar.println(format!("  {} {}", "↑".green(), path));
            }
            ProgressEvent::Delete { path } => {
                self.bar.println(format!("  {} {}", "✗".yellow(), path.dimmed()));
            }
            ProgressEvent::Restored { path } => {
                self.bar.println(format!("  {} {}", "↓".green(), path));
            }
            ProgressEvent::Error {
                path,
                stage,
                message,
            } => {
                self.bar.println(format!(
                    "  {} {} [{:?}]: {}",
                    "!".red().bold(),
                    path,
                    stage,
                    message.red()
                ));
            }
        }
    }
}

/// Library rescan on a background thread.
///
/// The launcher's scanner is not part of this binary; the hook reopens the
/// restored database and checks it so a broken snapshot is reported early.
struct ThreadRescan {
    db_path: PathBuf,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRescan {
    fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            handle: Mutex::new(None),
        }
    }

    /// Wait for a pending rescan before the process exits.
    fn wait(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl LibraryRescan for ThreadRescan {
    fn request_rescan(&self) {
        let path = self.db_path.clone();
        let handle = std::thread::spawn(move || {
            let db = SqliteDatabase::new(&path);
            let result = db.with_connection(|conn| {
                let status: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
                Ok(status)
            });
            match result {
                Ok(status) if status == "ok" => {
                    tracing::info!("[Library] Rescan: {} is healthy", path.display())
                }
                Ok(status) => tracing::warn!("[Library] Rescan: {}", status),
                Err(e) => tracing::warn!("[Library] Rescan failed: {:#}", e),
            }
        });
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }
}

fn print_meta(meta: &BackupMeta) {
    println!("  Backup ID:   {}", meta.backup_id.dimmed());
    println!("  Created:     {}", meta.created_at);
    println!("  Mode:        {:?}", meta.mode);
    println!(
        "  Files:       {} ({} uploaded, {} deleted)",
        meta.counts.files, meta.counts.uploaded, meta.counts.deleted
    );
}

// ============ AUTH COMMAND ============

fn cmd_auth(config_path: &Path, target: AuthTarget) -> Result<()> {
    println!("{}", "SaveSync Authentication".bold().cyan());
    println!();

    let params = match target {
        AuthTarget::Dropbox { app_key, port } => {
            let mut flow = PkceFlow::dropbox(&app_key);
            if let Some(port) = port {
                flow = flow.with_port(port);
            }
            let tokens = flow.authenticate(|url| {
                println!("Opening the Dropbox consent page. If no browser opens, visit:");
                println!("{}", url.blue().underline());
                println!();
            })?;
            ProviderParams::Dropbox(DropboxParams::new(
                &app_key,
                &tokens.access_token,
                &tokens.refresh_token,
            ))
        }
        AuthTarget::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            prefix,
        } => ProviderParams::S3(S3Params {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            prefix,
        }),
        AuthTarget::Webdav {
            url,
            username,
            password,
            root,
        } => ProviderParams::WebDav(WebDavParams {
            url,
            username,
            password,
            root,
        }),
        AuthTarget::Local { path } => ProviderParams::Local(LocalParams { path }),
    };
    params.validate()?;

    let kind = params.kind();
    let mut store = CredentialStore::load(&credentials_path(config_path))?;
    store.put(params);
    store.save()?;

    let mut config = load_config(config_path)?;
    config.provider = Some(kind.name().to_string());
    config.save(config_path)?;

    println!("{} {} is now the active provider", "✓".green(), kind.to_string().bold());
    println!(
        "You can now run {} to create your first backup.",
        "savesync backup".cyan()
    );
    Ok(())
}

// ============ BACKUP COMMAND ============

fn cmd_backup(config_path: &Path, full: bool, groups: Vec<BackupGroup>) -> Result<()> {
    println!("{}", "SaveSync Backup".bold().cyan());
    println!();

    let config = load_config(config_path)?;
    let mut store = CredentialStore::load(&credentials_path(config_path))?;
    let provider = open_provider(&config, &store)?;

    let db = SqliteDatabase::new(config.database_path());
    let ctx = LocalContext::new(&config.data_root, &config).with_database(&db);
    let options = BackupOptions {
        mode: if full {
            BackupMode::Full
        } else {
            BackupMode::Incremental
        },
        groups: selected_groups(groups),
    };

    let sink = ConsoleSink::new()?;
    let result = run_backup(provider.as_ref(), &options, &ctx, &sink);
    sink.finish();
    persist_refreshed(provider.as_ref(), &mut store)?;
    let summary = result?;

    println!();
    println!(
        "{} {} uploaded, {} deleted, {} files tracked",
        "✓".green(),
        summary.uploaded.to_string().bold(),
        summary.deleted,
        summary.total_local
    );
    if summary.failures > 0 {
        println!("{} {} file(s) failed", "!".red(), summary.failures);
    }
    if summary.meta.is_none() {
        println!(
            "{}",
            "Manifest was not written; the next backup will retry.".yellow()
        );
    }
    Ok(())
}

// ============ PLAN COMMAND ============

fn cmd_plan(config_path: &Path, groups: Vec<BackupGroup>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut store = CredentialStore::load(&credentials_path(config_path))?;
    let provider = open_provider(&config, &store)?;

    let db = SqliteDatabase::new(config.database_path());
    let ctx = LocalContext::new(&config.data_root, &config).with_database(&db);
    let plan = plan_restore(
        provider.as_ref(),
        &selected_groups(groups),
        &ctx,
        &config.ignore_patterns,
    );
    persist_refreshed(provider.as_ref(), &mut store)?;
    let plan = plan?;

    println!("{}", "SaveSync Restore Plan".bold().cyan());
    println!();
    match &plan.meta {
        Some(meta) => print_meta(meta),
        None => println!("  {}", "No backup metadata found".yellow()),
    }
    println!(
        "  Local: {}  Remote: {}  Shared: {} ({} identical, {} different)",
        plan.local_count, plan.remote_count, plan.intersect_count, plan.md5_equal, plan.md5_different
    );
    println!();

    for path in &plan.local_newer_paths {
        println!("  {} {} {}", "L".yellow().bold(), path, "(local newer)".dimmed());
    }
    for path in &plan.remote_newer_paths {
        println!("  {} {} {}", "R".cyan().bold(), path, "(remote newer)".dimmed());
    }
    for detail in plan.details.iter().filter(|d| d.ignored && !d.same_md5) {
        println!("  {} {} {}", "-".dimmed(), detail.path, "(ignored)".dimmed());
    }

    let decision = match plan.decision {
        RestoreDecision::Ok => "ok".green(),
        RestoreDecision::ConflictLocalNewer => "conflict-local-newer".yellow(),
        RestoreDecision::Conflict => "conflict".red(),
    };
    println!();
    println!("Decision: {}", decision.bold());
    Ok(())
}

// ============ RESTORE COMMAND ============

fn cmd_restore(
    config_path: &Path,
    groups: Vec<BackupGroup>,
    paths: Vec<String>,
    force: bool,
) -> Result<()> {
    println!("{}", "SaveSync Restore".bold().cyan());
    println!();

    let config = load_config(config_path)?;
    let mut store = CredentialStore::load(&credentials_path(config_path))?;
    let provider = open_provider(&config, &store)?;
    let groups = selected_groups(groups);

    let db = SqliteDatabase::new(config.database_path());
    let ctx = LocalContext::new(&config.data_root, &config).with_database(&db);

    let include = (!paths.is_empty()).then(|| PathMatcher::new(&paths));
    if !force {
        let plan = plan_restore(provider.as_ref(), &groups, &ctx, &config.ignore_patterns)?;
        let blocking = plan.blocking_paths(include.as_ref());
        if !blocking.is_empty() {
            println!("{}", "Local files differ from the backup:".yellow());
            for path in &blocking {
                println!("  {}", path);
            }
            println!();
            bail!(
                "Restore refused ({:?}). Re-run with --force to overwrite local files.",
                plan.decision
            );
        }
    }

    let options = RestoreOptions {
        groups,
        force,
        include_paths: if paths.is_empty() { None } else { Some(paths) },
    };
    let rescan = ThreadRescan::new(config.database_path());
    let sink = ConsoleSink::new()?;
    let result = execute_restore(provider.as_ref(), &options, &ctx, Some(&rescan), &sink);
    sink.finish();
    rescan.wait();
    persist_refreshed(provider.as_ref(), &mut store)?;
    let summary = result?;

    println!();
    println!(
        "{} {} restored, {} unchanged",
        "✓".green(),
        summary.restored.to_string().bold(),
        summary.skipped
    );
    if summary.db_restored {
        println!("  Library database restored");
    }
    if summary.failures > 0 {
        println!("{} {} file(s) failed", "!".red(), summary.failures);
    }
    Ok(())
}

// ============ STATUS COMMAND ============

fn cmd_status(config_path: &Path) -> Result<()> {
    println!("{}", "SaveSync Status".bold().cyan());
    println!();

    let config = load_config(config_path)?;
    println!("  Config:      {}", config_path.display());
    println!("  Data root:   {}", config.data_root.display());
    println!("  Database:    {}", config.database_path().display());
    println!("  Emulators:   {}", config.emulators.len());

    let kind: Option<ProviderKind> = config.provider_kind()?;
    let Some(kind) = kind else {
        println!("  Provider:    {}", "not configured".yellow());
        return Ok(());
    };
    println!("  Provider:    {}", kind.to_string().bold());

    let mut store = CredentialStore::load(&credentials_path(config_path))?;
    if store.get(kind).is_none() {
        println!("  {}", "No credentials stored. Run 'savesync auth'.".yellow());
        return Ok(());
    }

    let provider = open_provider(&config, &store)?;
    let meta = provider.read_text(META_FILE);
    persist_refreshed(provider.as_ref(), &mut store)?;

    println!();
    match meta? {
        Some(text) => print_meta(&BackupMeta::from_json(&text)?),
        None => println!("  {}", "No backup yet".dimmed()),
    }
    Ok(())
}
