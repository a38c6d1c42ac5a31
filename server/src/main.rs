//! Skybit self-hosted file browser server (skybitd)

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod config;
mod db;
mod storage;

use auth::Role;
use config::Config;

#[derive(Parser)]
#[command(name = "skybitd")]
#[command(about = "Skybit file browser server daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (runs in background)
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the server
    Down,
    /// Show server status
    Status,
    /// User management
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Share link management
    Shares {
        #[command(subcommand)]
        command: ShareCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a new user
    Create {
        /// Username
        #[arg(long)]
        username: String,
        /// Role: user, mod or admin
        #[arg(long, default_value = "user")]
        role: Role,
    },
    /// List all users
    List,
}

#[derive(Subcommand)]
enum ShareCommands {
    /// List active share links
    List,
    /// Remove expired share links and their archives
    Sweep,
}

fn pid_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skybitd.pid")
}

fn is_server_running() -> Option<u32> {
    let pid_path = pid_file();
    if pid_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                // Check if process is still running
                #[cfg(unix)]
                {
                    let result = Command::new("kill")
                        .args(["-0", &pid.to_string()])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status();
                    if result.map(|s| s.success()).unwrap_or(false) {
                        return Some(pid);
                    }
                }
                #[cfg(not(unix))]
                {
                    return Some(pid);
                }
            }
        }
        // Stale pid file, remove it
        let _ = fs::remove_file(&pid_path);
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't need full init
    match &cli.command {
        Commands::Down => {
            return stop_server();
        }
        Commands::Status => {
            return show_status();
        }
        Commands::Serve { foreground } if !foreground => {
            return start_daemon();
        }
        _ => {}
    }

    // Initialize logging for foreground commands
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skybitd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { foreground: _ } => {
            run_server(config).await?;
        }
        Commands::Down | Commands::Status => {}
        Commands::User { command } => match command {
            UserCommands::Create { username, role } => {
                create_user(&config, &username, role).await?;
            }
            UserCommands::List => {
                list_users(&config)?;
            }
        },
        Commands::Shares { command } => match command {
            ShareCommands::List => list_shares(&config)?,
            ShareCommands::Sweep => sweep_shares(&config)?,
        },
    }

    Ok(())
}

fn start_daemon() -> anyhow::Result<()> {
    // Check if already running
    if let Some(pid) = is_server_running() {
        println!("skybitd already running (pid {})", pid);
        return Ok(());
    }

    // Fail here rather than in the detached child
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let exe = std::env::current_exe()?;

    // Spawn detached process with --foreground flag
    let child = Command::new(&exe)
        .args(["serve", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let pid = child.id();

    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, pid.to_string())?;

    println!("skybitd serving on localhost:{}", config.rest_port);
    println!("pid: {}", pid);

    Ok(())
}

fn stop_server() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        #[cfg(unix)]
        {
            Command::new("kill").args([&pid.to_string()]).status()?;
        }
        #[cfg(not(unix))]
        {
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .status()?;
        }

        let _ = fs::remove_file(pid_file());
        println!("skybitd stopped");
    } else {
        println!("skybitd not running");
    }
    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    if let Some(pid) = is_server_running() {
        println!("skybitd running");
        println!("  pid: {}", pid);
        println!("  rest: localhost:{}", config.rest_port);
        println!("  root: {}", config.root_directory.display());
    } else {
        println!("skybitd not running");
    }
    Ok(())
}

/// The registry and share archives must never be reachable through the browser.
fn ensure_data_outside_root(guard: &storage::PathGuard, data_dir: &Path) -> anyhow::Result<()> {
    if guard.contains(data_dir) {
        anyhow::bail!(
            "DATA_DIRECTORY {} must not be inside ROOT_DIRECTORY {}",
            data_dir.display(),
            guard.root().display()
        );
    }
    Ok(())
}

/// Store-writing CLI commands would race the running server's in-memory state.
fn ensure_server_stopped(hint: &str) -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        anyhow::bail!(
            "skybitd is running (pid {}); {}",
            pid,
            hint
        );
    }
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    // Save PID for foreground mode too
    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;

    let guard = storage::PathGuard::new(&config.root_directory).map_err(|e| {
        anyhow::anyhow!(
            "ROOT_DIRECTORY {} is not usable: {}",
            config.root_directory.display(),
            e
        )
    })?;
    tracing::info!("serving files from {}", guard.root().display());

    fs::create_dir_all(&config.data_directory)?;
    ensure_data_outside_root(&guard, &config.data_directory)?;

    // Leftover download archives from a previous run
    let scratch = config.scratch_directory();
    let purged = storage::archive::purge_scratch(&scratch)?;
    if purged > 0 {
        tracing::info!("removed {} stale download archives", purged);
    }

    let shares = Arc::new(db::ShareStore::open(&config.data_directory)?);
    let users = Arc::new(db::UserStore::open(&config.data_directory)?);
    let files = storage::FileOps::new(guard, scratch, config.max_archive_bytes);

    let sweeper = shares
        .clone()
        .spawn_sweeper(Duration::from_secs(config.share_sweep_interval_secs.max(1)));

    let app_state = api::AppState::new(config.clone(), files, shares, users);

    // Start REST server
    let rest_addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.rest_port).parse()?;
    let rest_state = app_state.clone();
    let rest_handle = tokio::spawn(async move {
        tracing::info!("REST listening on {}", rest_addr);
        api::rest::serve(rest_addr, rest_state).await
    });

    // Wait for REST server
    let result = rest_handle.await;
    sweeper.abort();

    // Cleanup PID file
    let _ = fs::remove_file(pid_file());

    result??;
    Ok(())
}

async fn create_user(config: &Config, username: &str, role: Role) -> anyhow::Result<()> {
    use std::io::{self, Write};

    ensure_server_stopped("create users through the admin API, or stop it first")?;

    // Validate before prompting
    let username = db::users::normalize_username(username)?;

    // Always prompt for password interactively
    print!("Password: ");
    io::stdout().flush()?;

    let password = tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        let pass = rpassword::read_password()?;
        Ok(pass)
    })
    .await??;

    print!("Confirm password: ");
    io::stdout().flush()?;

    let confirm = tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        let pass = rpassword::read_password()?;
        Ok(pass)
    })
    .await??;

    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    let users = db::UserStore::open(&config.data_directory)?;
    let user = users.create(&username, &password, role)?;

    println!("User created: {} ({})", user.username, user.role);

    Ok(())
}

fn list_users(config: &Config) -> anyhow::Result<()> {
    for user in db::UserStore::peek(&config.data_directory)? {
        println!("{} ({})", user.username, user.role);
    }
    Ok(())
}

fn list_shares(config: &Config) -> anyhow::Result<()> {
    let records = db::ShareStore::peek(&config.data_directory)?;

    if records.is_empty() {
        println!("no active shares");
    } else {
        let now = chrono::Utc::now();
        for record in records {
            let kind = if record.is_folder { "folder" } else { "file" };
            println!(
                "{}  /{} ({}, {} min left)",
                config.share_url(&record.token),
                record.source,
                kind,
                record.minutes_remaining(now)
            );
        }
    }
    Ok(())
}

fn sweep_shares(config: &Config) -> anyhow::Result<()> {
    ensure_server_stopped("it sweeps expired shares on its own")?;

    let shares = db::ShareStore::open(&config.data_directory)?;
    let report = shares.sweep()?;
    println!(
        "removed {} expired shares ({} archives)",
        report.removed, report.artifacts_removed
    );
    Ok(())
}
