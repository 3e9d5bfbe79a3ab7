//! Chunked uploads and downloads over a session.
//!
//! Each transfer runs as its own task that keeps up to `window` chunk
//! requests in flight on the session multiplexer. Acknowledgements feed an
//! [`AckWindow`], whose contiguous prefix is the offset a paused or failed
//! transfer resumes from.

pub mod checksum;
mod driver;
pub mod window;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};

use crate::connections::errors::SftpError;
use crate::core::registry::ConnectionRegistry;
use crate::core::session::Session;
use crate::events::TransferEvent;

pub use window::AckWindow;

pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;
pub const MAX_WINDOW: usize = 64;

/// Remote digest policy once the last chunk is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheck {
    /// Fail when the server cannot produce a digest.
    Required,
    /// Verify when the server can, warn otherwise.
    BestEffort,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub chunk_size: u32,
    /// Chunk requests allowed in flight at once.
    pub window: usize,
    pub request_timeout_ms: u64,
    /// Extra attempts for a chunk whose request timed out.
    pub max_retries: u32,
    pub integrity: IntegrityCheck,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            window: 8,
            request_timeout_ms: 30_000,
            max_retries: 3,
            integrity: IntegrityCheck::BestEffort,
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), SftpError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SftpError::InvalidArgument(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.window == 0 || self.window > MAX_WINDOW {
            return Err(SftpError::InvalidArgument(format!(
                "window must be within 1..={MAX_WINDOW}, got {}",
                self.window
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(SftpError::InvalidArgument(
                "request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Nothing of this transfer is running.
    pub fn is_settled(self) -> bool {
        !matches!(self, TransferState::Queued | TransferState::Active)
    }

    /// No further state change is possible.
    pub fn is_final(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Cancelled)
    }
}

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub id: String,
    pub profile_id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub resumable_offset: u64,
    pub chunk_size: u32,
    pub state: TransferState,
    pub resumable: bool,
    pub error: Option<String>,
}

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

pub(crate) struct Progress {
    pub(crate) total: u64,
    pub(crate) acks: AckWindow,
    pub(crate) error: Option<SftpError>,
    pub(crate) throttle: driver::ProgressThrottle,
}

pub(crate) struct TransferInner {
    pub(crate) id: String,
    pub(crate) profile_id: String,
    pub(crate) direction: TransferDirection,
    pub(crate) local_path: PathBuf,
    pub(crate) remote_path: String,
    pub(crate) options: TransferOptions,
    pub(crate) progress: StdMutex<Progress>,
    pub(crate) state_tx: watch::Sender<TransferState>,
    control: AtomicU8,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) resumable: AtomicBool,
    pub(crate) events: broadcast::Sender<TransferEvent>,
}

impl TransferInner {
    pub(crate) fn pausing(&self) -> bool {
        self.control.load(Ordering::SeqCst) == PAUSE
    }

    pub(crate) fn cancelling(&self) -> bool {
        self.control.load(Ordering::SeqCst) == CANCEL
    }

    pub(crate) fn running(&self) -> bool {
        self.control.load(Ordering::SeqCst) == RUN
    }

    pub(crate) fn with_progress<T>(&self, f: impl FnOnce(&mut Progress) -> T) -> T {
        let mut guard = match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn name(&self) -> String {
        match self.direction {
            TransferDirection::Upload => self
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.local_path.display().to_string()),
            TransferDirection::Download => self
                .remote_path
                .rsplit('/')
                .find(|part| !part.is_empty())
                .unwrap_or(&self.remote_path)
                .to_string(),
        }
    }
}

/// Handle to one transfer. Clones refer to the same transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl Transfer {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn profile_id(&self) -> &str {
        &self.inner.profile_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.inner.direction
    }

    pub fn state(&self) -> TransferState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<TransferState> {
        self.inner.state_tx.subscribe()
    }

    pub fn resumable_offset(&self) -> u64 {
        self.inner.with_progress(|p| p.acks.resumable_offset())
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.with_progress(|p| p.acks.acknowledged())
    }

    /// Chunk requests currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// The failure of the last run, with transfer context.
    pub fn error(&self) -> Option<SftpError> {
        self.inner.with_progress(|p| p.error.clone())
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let state = self.state();
        self.inner.with_progress(|p| TransferSnapshot {
            id: self.inner.id.clone(),
            profile_id: self.inner.profile_id.clone(),
            direction: self.inner.direction,
            local_path: self.inner.local_path.clone(),
            remote_path: self.inner.remote_path.clone(),
            total_size: p.total,
            bytes_transferred: p.acks.acknowledged(),
            resumable_offset: p.acks.resumable_offset(),
            chunk_size: self.inner.options.chunk_size,
            state,
            resumable: self.inner.resumable.load(Ordering::SeqCst),
            error: p.error.as_ref().map(|e| e.to_string()),
        })
    }

    /// Wait until the transfer stops running (completed, failed, paused or
    /// cancelled) and return that state.
    pub async fn finished(&self) -> TransferState {
        let mut rx = self.state_watch();
        wait_state(&mut rx, TransferState::is_settled).await
    }

    fn launch(&self, session: Arc<Session>) {
        tokio::spawn(driver::run(self.inner.clone(), session));
    }
}

async fn wait_state(
    rx: &mut watch::Receiver<TransferState>,
    done: impl Fn(TransferState) -> bool,
) -> TransferState {
    let settled = match rx.wait_for(|s| done(*s)).await {
        Ok(state) => Some(*state),
        Err(_) => None,
    };
    settled.unwrap_or_else(|| *rx.borrow())
}

/// Owns every transfer until it is forgotten.
#[derive(Clone)]
pub struct TransferEngine {
    registry: ConnectionRegistry,
    transfers: Arc<Mutex<HashMap<String, Transfer>>>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferEngine {
    /// The registry is used to find a live session when a transfer resumes.
    pub fn new(registry: ConnectionRegistry) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            registry,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub async fn start_upload(
        &self,
        session: &Arc<Session>,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        options: TransferOptions,
    ) -> Result<Transfer, SftpError> {
        options.validate()?;
        let local_path = local_path.as_ref().to_path_buf();
        let total = tokio::fs::metadata(&local_path).await?.len();
        self.start(
            session,
            TransferDirection::Upload,
            local_path,
            remote_path,
            total,
            options,
        )
        .await
    }

    pub async fn start_download(
        &self,
        session: &Arc<Session>,
        remote_path: &str,
        local_path: impl AsRef<Path>,
        options: TransferOptions,
    ) -> Result<Transfer, SftpError> {
        options.validate()?;
        let attrs = session.stat(remote_path).await?;
        if attrs.is_dir() {
            return Err(SftpError::InvalidArgument(format!(
                "{remote_path} is a directory"
            )));
        }
        let total = attrs.size.ok_or_else(|| {
            SftpError::Protocol(format!("server reported no size for {remote_path}"))
        })?;
        self.start(
            session,
            TransferDirection::Download,
            local_path.as_ref().to_path_buf(),
            remote_path,
            total,
            options,
        )
        .await
    }

    async fn start(
        &self,
        session: &Arc<Session>,
        direction: TransferDirection,
        local_path: PathBuf,
        remote_path: &str,
        total: u64,
        options: TransferOptions,
    ) -> Result<Transfer, SftpError> {
        if !session.is_open() {
            return Err(session.failure().unwrap_or(SftpError::SessionClosed));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (state_tx, _) = watch::channel(TransferState::Queued);
        let transfer = Transfer {
            inner: Arc::new(TransferInner {
                id: id.clone(),
                profile_id: session.profile_id().to_string(),
                direction,
                local_path,
                remote_path: remote_path.to_string(),
                options,
                progress: StdMutex::new(Progress {
                    total,
                    acks: AckWindow::new(),
                    error: None,
                    throttle: driver::ProgressThrottle::default(),
                }),
                state_tx,
                control: AtomicU8::new(RUN),
                in_flight: AtomicUsize::new(0),
                resumable: AtomicBool::new(true),
                events: self.events.clone(),
            }),
        };
        info!(
            "transfer {} queued: {:?} {} <-> {} ({} bytes)",
            id,
            direction,
            transfer.inner.local_path.display(),
            remote_path,
            total
        );
        self.transfers.lock().await.insert(id, transfer.clone());
        transfer.launch(session.clone());
        Ok(transfer)
    }

    pub async fn get(&self, id: &str) -> Option<Transfer> {
        self.transfers.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<TransferSnapshot> {
        self.transfers
            .lock()
            .await
            .values()
            .map(Transfer::snapshot)
            .collect()
    }

    /// Drop a settled transfer from the engine.
    pub async fn forget(&self, id: &str) -> Result<(), SftpError> {
        let mut map = self.transfers.lock().await;
        match map.get(id) {
            Some(t) if !t.state().is_settled() => Err(SftpError::InvalidArgument(format!(
                "transfer {id} is still running"
            ))),
            Some(_) => {
                map.remove(id);
                Ok(())
            }
            None => Err(unknown(id)),
        }
    }

    async fn lookup(&self, id: &str) -> Result<Transfer, SftpError> {
        self.get(id).await.ok_or_else(|| unknown(id))
    }

    /// Stop issuing chunks, let the in-flight ones drain and report Paused.
    pub async fn pause(&self, id: &str) -> Result<TransferState, SftpError> {
        let transfer = self.lookup(id).await?;
        match transfer.state() {
            TransferState::Queued | TransferState::Active => {
                let _ = transfer.inner.control.compare_exchange(
                    RUN,
                    PAUSE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                debug!("transfer {} pausing", id);
                Ok(transfer.finished().await)
            }
            TransferState::Paused => Ok(TransferState::Paused),
            other => Err(SftpError::InvalidArgument(format!(
                "cannot pause a {other:?} transfer"
            ))),
        }
    }

    /// Continue a paused or failed transfer from its resumable offset on the
    /// profile's live session.
    pub async fn resume(&self, id: &str) -> Result<Transfer, SftpError> {
        let transfer = self.lookup(id).await?;
        let state = transfer.state();
        if !matches!(state, TransferState::Paused | TransferState::Failed) {
            return Err(SftpError::InvalidArgument(format!(
                "cannot resume a {state:?} transfer"
            )));
        }
        if !transfer.inner.resumable.load(Ordering::SeqCst) {
            return Err(SftpError::InvalidArgument(format!(
                "transfer {id} failed its integrity check; start a new transfer"
            )));
        }
        let session = self
            .registry
            .get(transfer.profile_id())
            .await
            .ok_or(SftpError::SessionClosed)?;

        transfer.inner.control.store(RUN, Ordering::SeqCst);
        transfer.inner.with_progress(|p| p.error = None);
        transfer.inner.set_state(TransferState::Queued);
        info!(
            "transfer {} resuming at {}",
            id,
            transfer.resumable_offset()
        );
        transfer.launch(session);
        Ok(transfer)
    }

    /// Cancel cooperatively. Returns once no chunk request is pending.
    pub async fn cancel(&self, id: &str) -> Result<TransferState, SftpError> {
        let transfer = self.lookup(id).await?;
        loop {
            match transfer.state() {
                TransferState::Queued | TransferState::Active => {
                    transfer.inner.control.store(CANCEL, Ordering::SeqCst);
                    debug!(
                        "transfer {} cancelling, draining {} chunks",
                        id,
                        transfer.in_flight()
                    );
                    // The run may also have settled on its own meanwhile.
                    transfer.finished().await;
                }
                TransferState::Paused | TransferState::Failed => {
                    transfer.inner.control.store(CANCEL, Ordering::SeqCst);
                    transfer.inner.set_state(TransferState::Cancelled);
                    transfer.inner.emit(TransferEvent::Cancelled {
                        transfer_id: id.to_string(),
                    });
                    info!("transfer {} cancelled", id);
                    return Ok(TransferState::Cancelled);
                }
                TransferState::Cancelled => return Ok(TransferState::Cancelled),
                TransferState::Completed => {
                    return Err(SftpError::InvalidArgument(format!(
                        "transfer {id} already completed"
                    )))
                }
            }
        }
    }
}

fn unknown(id: &str) -> SftpError {
    SftpError::InvalidArgument(format!("no transfer with id '{id}'"))
}
