use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{debug, info};
use sftp_core::core::{IntegrityCheck, Session, Transfer, TransferEngine, TransferState};
use sftp_core::events::TransferEvent;
use sftp_core::storage::{ConnectionProfile, CredentialRef, ProfileStore};
use sftp_core::{ClientConfig, ConnectionRegistry, SftpError, TransportFactory};
use tokio::sync::broadcast;

use super::progress::ProgressLine;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "sftp-rs", version, subcommand_required = true)]
pub struct Args {
    #[command(flatten)]
    pub target: Target,

    #[command(flatten)]
    pub tuning: Tuning,

    #[command(subcommand)]
    pub command: Command,
}

/// Which server to talk to: a saved profile or explicit connection flags.
#[derive(clap::Args, Debug)]
pub struct Target {
    /// Name of a saved profile
    #[arg(long, global = true, conflicts_with_all = ["host", "username"])]
    pub profile: Option<String>,
    /// SSH server host
    #[arg(long, global = true)]
    pub host: Option<String>,
    /// SSH server port
    #[arg(long, global = true, default_value_t = 22)]
    pub port: u16,
    /// Username for SSH authentication
    #[arg(long, global = true)]
    pub username: Option<String>,
    /// Password for SSH authentication
    #[arg(long, global = true, conflicts_with_all = ["key", "agent"])]
    pub password: Option<String>,
    /// Private key file
    #[arg(long, global = true, conflicts_with = "agent")]
    pub key: Option<PathBuf>,
    /// Authenticate through the running ssh agent
    #[arg(long, global = true)]
    pub agent: bool,
}

/// Overrides for values from config.toml.
#[derive(clap::Args, Debug, Default)]
pub struct Tuning {
    /// Bytes per chunk request
    #[arg(long, global = true)]
    pub chunk_size: Option<u32>,
    /// Chunk requests in flight per transfer
    #[arg(long, global = true)]
    pub window: Option<usize>,
    /// Per-request deadline in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
    /// Digest check after a transfer
    #[arg(long, global = true, value_enum)]
    pub verify: Option<Verify>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Verify {
    Required,
    BestEffort,
    Off,
}

impl Tuning {
    fn apply(&self, config: &mut ClientConfig) -> Result<(), SftpError> {
        if let Some(chunk_size) = self.chunk_size {
            config.transfer.chunk_size = chunk_size;
        }
        if let Some(window) = self.window {
            config.transfer.window = window;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.transfer.request_timeout_ms = timeout_ms;
            config.session.request_timeout_ms = timeout_ms;
        }
        if let Some(verify) = self.verify {
            config.transfer.integrity = match verify {
                Verify::Required => IntegrityCheck::Required,
                Verify::BestEffort => IntegrityCheck::BestEffort,
                Verify::Off => IntegrityCheck::Off,
            };
        }
        config.transfer.validate()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect, print the server version and disconnect
    Test,
    /// List a remote directory
    Ls {
        /// Remote directory (default: home)
        path: Option<String>,
    },
    /// Print the remote working directory
    Pwd,
    /// Download a file
    Get { remote: String, local: PathBuf },
    /// Upload a file
    Put { local: PathBuf, remote: String },
    /// Create a remote directory
    Mkdir { path: String },
    /// Remove a remote file, or a directory with --dir
    Rm {
        path: String,
        #[arg(long)]
        dir: bool,
    },
    /// Manage saved profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    /// Show saved profiles, most recently used first
    List,
    /// Save the connection flags under a name
    Save {
        name: String,
        /// Keep the --password in the OS keyring
        #[arg(long)]
        remember: bool,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a saved profile
    Delete { name: String },
}

pub async fn run_cli(args: Args) -> Result<(), SftpError> {
    let mut config = ClientConfig::load()?;
    args.tuning.apply(&mut config)?;
    debug!("effective config: {:?}", config);

    let command = match args.command {
        Command::Profiles { action } => return run_profiles(action, &args.target),
        command => command,
    };

    let profile = resolve_profile(&args.target)?;
    let registry = ConnectionRegistry::new(transport_factory(&config)?, config.session.clone());
    let engine = TransferEngine::new(registry.clone());

    info!("Connecting to {}", profile.endpoint());
    let session = registry.open(&profile).await?;
    let outcome = run_command(command, &session, &engine, &config).await;
    registry.close_all().await;
    outcome
}

#[cfg(feature = "ssh")]
fn transport_factory(config: &ClientConfig) -> Result<Arc<dyn TransportFactory>, SftpError> {
    Ok(Arc::new(sftp_core::connections::SshTransportFactory::new(
        config.session.connect_timeout(),
    )))
}

#[cfg(not(feature = "ssh"))]
fn transport_factory(_config: &ClientConfig) -> Result<Arc<dyn TransportFactory>, SftpError> {
    Err(SftpError::InvalidArgument(
        "sftp-rs was built without the `ssh` feature".into(),
    ))
}

async fn run_command(
    command: Command,
    session: &Arc<Session>,
    engine: &TransferEngine,
    config: &ClientConfig,
) -> Result<(), SftpError> {
    match command {
        Command::Test => {
            let server = session.server();
            println!(
                "connected to {} (SFTP v{}, {} extension(s){})",
                session.profile().endpoint(),
                server.version,
                server.extensions.len(),
                if session.supports_check_file() {
                    ", remote checksums"
                } else {
                    ""
                }
            );
        }
        Command::Pwd => println!("{}", session.realpath(".").await?),
        Command::Ls { path } => {
            let path = match path {
                Some(path) => path,
                None => session.realpath(".").await?,
            };
            for entry in session.list_dir(&path).await? {
                if entry.long_name.is_empty() || entry.long_name == entry.name {
                    let suffix = if entry.attrs.is_dir() { "/" } else { "" };
                    println!("{}{}", entry.name, suffix);
                } else {
                    println!("{}", entry.long_name);
                }
            }
        }
        Command::Mkdir { path } => session.mkdir(&path).await?,
        Command::Rm { path, dir: true } => session.remove_dir(&path).await?,
        Command::Rm { path, dir: false } => session.remove_file(&path).await?,
        Command::Get { remote, local } => {
            let local = local_target(&remote, local);
            let events = engine.subscribe();
            let transfer = engine
                .start_download(session, &remote, &local, config.transfer.clone())
                .await?;
            follow(engine, transfer, events).await?;
        }
        Command::Put { local, remote } => {
            let remote = remote_target(&local, remote);
            let events = engine.subscribe();
            let transfer = engine
                .start_upload(session, &local, &remote, config.transfer.clone())
                .await?;
            follow(engine, transfer, events).await?;
        }
        Command::Profiles { .. } => {}
    }
    Ok(())
}

/// `put file.txt /srv/` lands on `/srv/file.txt`.
fn remote_target(local: &Path, remote: String) -> String {
    match local.file_name() {
        Some(name) if remote.ends_with('/') => format!("{remote}{}", name.to_string_lossy()),
        _ => remote,
    }
}

/// `get /srv/a.bin downloads/` lands on `downloads/a.bin`, as does an
/// existing local directory given without the trailing separator.
fn local_target(remote: &str, local: PathBuf) -> PathBuf {
    let into_dir = local.is_dir() || local.as_os_str().to_string_lossy().ends_with(['/', '\\']);
    match remote.rsplit('/').next() {
        Some(name) if into_dir && !name.is_empty() => local.join(name),
        _ => local,
    }
}

/// Render progress until the transfer settles. Ctrl-C cancels it.
async fn follow(
    engine: &TransferEngine,
    transfer: Transfer,
    mut events: broadcast::Receiver<TransferEvent>,
) -> Result<(), SftpError> {
    let snapshot = transfer.snapshot();
    let name = match snapshot.local_path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => snapshot.remote_path.clone(),
    };
    let mut line = ProgressLine::new(name, snapshot.total_size);
    line.update(transfer.bytes_transferred());

    let mut finished = pin!(transfer.finished());
    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut cancelling = false;
    let mut listening = true;

    let state = loop {
        tokio::select! {
            state = &mut finished => break state,
            event = events.recv(), if listening => match event {
                Ok(TransferEvent::Progress { transfer_id, bytes_transferred, .. })
                    if transfer_id == transfer.id() =>
                {
                    line.update(bytes_transferred);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => listening = false,
            },
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                line.message("cancelling, waiting for in-flight chunks...");
                let engine = engine.clone();
                let id = transfer.id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = engine.cancel(&id).await {
                        debug!("cancel of {} failed: {}", id, e);
                    }
                });
            }
        }
    };

    match state {
        TransferState::Completed => {
            line.update(transfer.bytes_transferred());
            line.message("done");
            Ok(())
        }
        TransferState::Cancelled => {
            line.message("cancelled");
            Err(SftpError::Cancelled)
        }
        other => {
            line.message(&format!("{other:?}").to_lowercase());
            Err(transfer.error().unwrap_or(SftpError::Cancelled))
        }
    }
}

fn resolve_profile(target: &Target) -> Result<ConnectionProfile, SftpError> {
    if let Some(name) = &target.profile {
        let store = ProfileStore::new()?;
        let profile = store
            .find_by_name(name)?
            .ok_or_else(|| SftpError::InvalidArgument(format!("no saved profile named '{name}'")))?;
        store.touch(&profile.id)?;
        return Ok(profile);
    }
    profile_from_flags(target, "cli", false)
}

fn profile_from_flags(
    target: &Target,
    name: &str,
    remember: bool,
) -> Result<ConnectionProfile, SftpError> {
    let (Some(host), Some(username)) = (&target.host, &target.username) else {
        return Err(SftpError::InvalidArgument(
            "either --profile or both --host and --username are required".into(),
        ));
    };
    let credential = if let Some(password) = &target.password {
        CredentialRef::Inline {
            password: password.clone(),
            remember,
        }
    } else if let Some(path) = &target.key {
        CredentialRef::KeyFile {
            path: path.clone(),
            passphrase_in_keyring: false,
        }
    } else if target.agent {
        CredentialRef::Agent
    } else {
        return Err(SftpError::InvalidArgument(
            "one of --password, --key or --agent is required".into(),
        ));
    };
    Ok(ConnectionProfile::new(
        name,
        host.clone(),
        target.port,
        username.clone(),
        credential,
    ))
}

fn run_profiles(action: ProfileAction, target: &Target) -> Result<(), SftpError> {
    let store = ProfileStore::new()?;
    match action {
        ProfileAction::List => {
            for profile in store.list()? {
                let used = profile
                    .last_used
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                println!("{:<20} {:<40} last used {}", profile.name, profile.endpoint(), used);
            }
        }
        ProfileAction::Save {
            name,
            remember,
            description,
        } => {
            let mut profile = profile_from_flags(target, &name, remember)?;
            profile.description = description;
            let id = store.save(&profile)?;
            println!("saved {name} ({id})");
        }
        ProfileAction::Delete { name } => match store.find_by_name(&name)? {
            Some(profile) => {
                store.delete(&profile.id)?;
                println!("deleted {name}");
            }
            None => {
                return Err(SftpError::InvalidArgument(format!(
                    "no saved profile named '{name}'"
                )))
            }
        },
    }
    Ok(())
}
