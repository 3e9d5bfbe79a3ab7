use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::connections::errors::SftpError;
use crate::connections::transport::{Credential, Transport};
use crate::core::multiplexer::{Multiplexer, PendingResponse};
use crate::protocol::{
    decode_version, encode_init, DirEntry, FileAttrs, Request, Response, ServerVersion,
    StatusCode, CHECK_FILE_HANDLE, SFTP_VERSION,
};
use crate::storage::profile::ConnectionProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Connecting,
    Authenticated,
    /// Open, no request outstanding.
    Idle,
    /// Open, at least one request outstanding.
    Busy,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Busy)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

/// Named steps of bringing a session up, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectPhase {
    ResolvingCredential,
    Socket,
    KeyExchange,
    Authenticating,
    Subsystem,
    VersionExchange,
    Ready,
}

impl ConnectPhase {
    fn next(self) -> ConnectPhase {
        match self {
            ConnectPhase::ResolvingCredential => ConnectPhase::Socket,
            ConnectPhase::Socket => ConnectPhase::KeyExchange,
            ConnectPhase::KeyExchange => ConnectPhase::Authenticating,
            ConnectPhase::Authenticating => ConnectPhase::Subsystem,
            ConnectPhase::Subsystem => ConnectPhase::VersionExchange,
            ConnectPhase::VersionExchange | ConnectPhase::Ready => ConnectPhase::Ready,
        }
    }

    /// Attribute a failure to this phase.
    fn classify(self, profile: &ConnectionProfile, err: SftpError) -> SftpError {
        match (self, err) {
            (_, e @ SftpError::MissingCredential(_)) => e,
            (ConnectPhase::Socket, e @ SftpError::Unreachable(_)) => e,
            (ConnectPhase::Socket, e) => SftpError::Unreachable(e.to_string()),
            (ConnectPhase::Authenticating, e @ SftpError::AuthRejected { .. }) => e,
            (ConnectPhase::Authenticating, e) => SftpError::AuthRejected {
                username: profile.username.clone(),
                host: profile.host.clone(),
                reason: e.to_string(),
            },
            (_, e @ SftpError::Protocol(_)) => e,
            (phase, e) => SftpError::Protocol(format!("{phase:?}: {e}")),
        }
    }
}

/// An open SFTP session on one profile.
///
/// Owns the multiplexer's I/O task and the keepalive task. Obtained from
/// [`Session::connect`], normally through the connection registry.
pub struct Session {
    profile: ConnectionProfile,
    server: ServerVersion,
    mux: Multiplexer,
    status_rx: watch::Receiver<SessionStatus>,
    config: SessionConfig,
    io_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Drive `transport` through every connect phase and start the I/O task.
    pub async fn connect(
        profile: ConnectionProfile,
        mut transport: Box<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Arc<Session>, SftpError> {
        let status_tx = Arc::new(watch::channel(SessionStatus::Connecting).0);
        let status_rx = status_tx.subscribe();

        let server = match establish(&profile, transport.as_mut(), &config, &status_tx).await {
            Ok(server) => server,
            Err(e) => {
                error!("connect to {} failed: {}", profile.endpoint(), e);
                let _ = transport.disconnect().await;
                status_tx.send_replace(SessionStatus::Failed);
                return Err(e);
            }
        };

        status_tx.send_replace(SessionStatus::Idle);
        let (mux, io_task) = Multiplexer::spawn(profile.id.as_str(), transport, status_tx, 1);
        info!(
            "session {} ready on {} (sftp v{})",
            profile.id,
            profile.endpoint(),
            server.version
        );

        let session = Arc::new(Session {
            profile,
            server,
            mux,
            status_rx,
            config,
            io_task: Mutex::new(Some(io_task)),
            keepalive_task: StdMutex::new(None),
        });

        if let Some(interval) = session.config.keepalive_interval() {
            let task = tokio::spawn(keepalive_loop(
                session.profile.id.clone(),
                session.mux.clone(),
                session.status_rx.clone(),
                interval,
                session.config.keepalive_timeout(),
                session.config.keepalive_max_missed.max(1),
            ));
            if let Ok(mut slot) = session.keepalive_task.lock() {
                *slot = Some(task);
            }
        }
        Ok(session)
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn profile_id(&self) -> &str {
        &self.profile.id
    }

    pub fn server(&self) -> &ServerVersion {
        &self.server
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Receiver that observes every status change.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// The error that failed the session, if any.
    pub fn failure(&self) -> Option<SftpError> {
        self.mux.failure()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }

    pub fn pending_count(&self) -> usize {
        self.mux.pending_count()
    }

    pub fn supports_check_file(&self) -> bool {
        self.server.supports(CHECK_FILE_HANDLE)
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Submit a request without waiting for its response.
    pub fn send(&self, request: &Request) -> Result<PendingResponse, SftpError> {
        self.mux.send(request)
    }

    /// Submit a request and wait up to the session request timeout.
    pub async fn request(&self, request: &Request) -> Result<Response, SftpError> {
        self.send(request)?.wait(self.request_timeout()).await
    }

    /// Send one keepalive probe and wait for its answer.
    pub async fn keepalive(&self) -> Result<(), SftpError> {
        probe(&self.mux, self.config.keepalive_timeout()).await
    }

    /// Close the session and wait for its I/O task to finish.
    pub async fn close(&self) {
        if let Ok(mut slot) = self.keepalive_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.mux.shutdown();
        if let Some(task) = self.io_task.lock().await.take() {
            let _ = task.await;
        }
    }

    pub async fn realpath(&self, path: &str) -> Result<String, SftpError> {
        let names = self
            .request(&Request::Realpath { path: path.into() })
            .await?
            .into_names()?;
        names
            .into_iter()
            .next()
            .map(|entry| entry.name)
            .ok_or_else(|| SftpError::Protocol(format!("empty realpath reply for {path}")))
    }

    pub async fn stat(&self, path: &str) -> Result<FileAttrs, SftpError> {
        self.request(&Request::Stat { path: path.into() })
            .await?
            .into_attrs()
    }

    /// Directory listing without `.` and `..`.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let handle = self
            .request(&Request::Opendir { path: path.into() })
            .await?
            .into_handle()?;
        let listing = self.read_dir(&handle).await;
        self.close_handle(handle).await;
        listing
    }

    async fn read_dir(&self, handle: &Bytes) -> Result<Vec<DirEntry>, SftpError> {
        let mut entries = Vec::new();
        loop {
            let response = self
                .request(&Request::Readdir {
                    handle: handle.clone(),
                })
                .await?;
            if let Response::Status {
                code: StatusCode::Eof,
                ..
            } = response
            {
                return Ok(entries);
            }
            entries.extend(
                response
                    .into_names()?
                    .into_iter()
                    .filter(|entry| entry.name != "." && entry.name != ".."),
            );
        }
    }

    /// Close a remote handle, logging rather than failing.
    pub async fn close_handle(&self, handle: Bytes) {
        let closed = self
            .request(&Request::Close { handle })
            .await
            .and_then(Response::into_ok);
        if let Err(e) = closed {
            warn!("[{}] closing remote handle failed: {}", self.profile.id, e);
        }
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.request(&Request::Mkdir {
            path: path.into(),
            attrs: FileAttrs::default(),
        })
        .await?
        .into_ok()
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.request(&Request::Remove { path: path.into() })
            .await?
            .into_ok()
    }

    pub async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.request(&Request::Rmdir { path: path.into() })
            .await?
            .into_ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.keepalive_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.mux.shutdown();
    }
}

async fn establish(
    profile: &ConnectionProfile,
    transport: &mut dyn Transport,
    config: &SessionConfig,
    status_tx: &watch::Sender<SessionStatus>,
) -> Result<ServerVersion, SftpError> {
    let deadline = config.connect_timeout();
    let mut phase = ConnectPhase::ResolvingCredential;
    let mut credential: Option<Credential> = None;
    let mut server: Option<ServerVersion> = None;

    while phase != ConnectPhase::Ready {
        debug!("[{}] {:?}", profile.id, phase);
        let step = match phase {
            ConnectPhase::ResolvingCredential => profile
                .credential
                .resolve(&profile.id)
                .map(|c| credential = Some(c)),
            ConnectPhase::Socket => within(phase, deadline, transport.open()).await,
            ConnectPhase::KeyExchange => within(phase, deadline, transport.handshake()).await,
            ConnectPhase::Authenticating => match &credential {
                Some(credential) => {
                    within(
                        phase,
                        deadline,
                        transport.authenticate(&profile.username, credential),
                    )
                    .await
                }
                None => Err(SftpError::MissingCredential(profile.id.clone())),
            },
            ConnectPhase::Subsystem => within(phase, deadline, transport.start_subsystem()).await,
            ConnectPhase::VersionExchange => within(phase, deadline, exchange_version(transport))
                .await
                .map(|v| server = Some(v)),
            ConnectPhase::Ready => Ok(()),
        };
        step.map_err(|e| phase.classify(profile, e))?;

        if phase == ConnectPhase::Authenticating {
            info!("authenticated as {}", profile.endpoint());
            status_tx.send_replace(SessionStatus::Authenticated);
        }
        phase = phase.next();
    }

    server.ok_or_else(|| SftpError::Protocol("no VERSION received".into()))
}

async fn within<T>(
    phase: ConnectPhase,
    deadline: Duration,
    work: impl Future<Output = Result<T, SftpError>>,
) -> Result<T, SftpError> {
    tokio::time::timeout(deadline, work)
        .await
        .map_err(|_| SftpError::Protocol(format!("{phase:?} timed out after {deadline:?}")))?
}

async fn exchange_version(transport: &mut dyn Transport) -> Result<ServerVersion, SftpError> {
    transport.write_packet(encode_init(SFTP_VERSION)).await?;
    let server = decode_version(&transport.read_packet().await?)?;
    if server.version < SFTP_VERSION {
        return Err(SftpError::Protocol(format!(
            "server speaks sftp v{}, need v{}",
            server.version, SFTP_VERSION
        )));
    }
    debug!("server extensions: {:?}", server.extensions);
    Ok(server)
}

/// Wait until the status is Closed or Failed and return it.
pub(crate) async fn wait_terminal(rx: &mut watch::Receiver<SessionStatus>) -> SessionStatus {
    match rx.wait_for(|s| s.is_terminal()).await {
        Ok(status) => *status,
        Err(_) => SessionStatus::Closed,
    }
}

async fn probe(mux: &Multiplexer, timeout: Duration) -> Result<(), SftpError> {
    mux.send(&Request::Realpath { path: ".".into() })?
        .wait(timeout)
        .await
        .map(|_| ())
}

/// Probe the server whenever an interval passes without inbound traffic.
async fn keepalive_loop(
    label: String,
    mux: Multiplexer,
    mut status_rx: watch::Receiver<SessionStatus>,
    interval: Duration,
    timeout: Duration,
    max_missed: u32,
) {
    let mut missed = 0u32;
    let mut seen = mux.activity();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_terminal(&mut status_rx) => return,
        }
        if mux.activity() != seen {
            seen = mux.activity();
            missed = 0;
            continue;
        }
        match probe(&mux, timeout).await {
            Ok(()) => missed = 0,
            Err(e) if e.is_timeout() => {
                missed += 1;
                warn!("[{}] keepalive probe missed ({}/{})", label, missed, max_missed);
                if missed >= max_missed {
                    error!("[{}] server stopped answering", label);
                    mux.fail(SftpError::Protocol(format!(
                        "{missed} keepalive probes unanswered"
                    )));
                    return;
                }
            }
            Err(_) => return,
        }
        seen = mux.activity();
    }
}
