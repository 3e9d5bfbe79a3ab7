#![allow(dead_code)]

pub mod fake_transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use sftp_core::config::SessionConfig;
use sftp_core::core::{ConnectionRegistry, TransferEngine, TransferOptions};
use sftp_core::events::{LifecycleEvent, TransferEvent};
use sftp_core::storage::{ConnectionProfile, CredentialRef};
use tokio::sync::broadcast;
use tokio::time::timeout;

use fake_transport::{FakeFactory, FakeRemote};

pub const MIB: usize = 1024 * 1024;

/// Logs appear only with `-- --nocapture` or when a test fails.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub fn profile(name: &str) -> ConnectionProfile {
    ConnectionProfile::new(
        name,
        "fake.example",
        22,
        "tester",
        CredentialRef::Inline {
            password: "secret".into(),
            remember: false,
        },
    )
}

/// Session settings with keepalive off and short deadlines.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        keepalive_interval_ms: 0,
        ..SessionConfig::default()
    }
}

pub struct Harness {
    pub remote: Arc<FakeRemote>,
    pub registry: ConnectionRegistry,
    pub engine: TransferEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(session_config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_logging();
        let remote = FakeRemote::new();
        let registry = ConnectionRegistry::new(
            Arc::new(FakeFactory {
                remote: remote.clone(),
            }),
            config,
        );
        let engine = TransferEngine::new(registry.clone());
        Self {
            remote,
            registry,
            engine,
        }
    }
}

pub fn options(chunk: usize, window: usize) -> TransferOptions {
    TransferOptions {
        chunk_size: chunk as u32,
        window,
        request_timeout_ms: 2_000,
        ..TransferOptions::default()
    }
}

/// Deterministic, non-repeating-per-chunk content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 4093) % 251) as u8).collect()
}

pub fn local_file(dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, data)?;
    Ok(path)
}

pub async fn next_lifecycle(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a lifecycle event")
        .expect("lifecycle channel closed unexpectedly")
}

/// Skip transfer events until one matches.
pub async fn wait_transfer_event(
    rx: &mut broadcast::Receiver<TransferEvent>,
    matches: impl Fn(&TransferEvent) -> bool,
) -> TransferEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("transfer channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a transfer event")
}
