//! A deterministic **in-process SFTP server** behind the `Transport` trait.
//!
//! *  **From the test's perspective**
//!    * Seed files with `remote.put_file(..)` and read them back with
//!      `remote.file(..)`.
//!    * Flip faults on `remote.faults()` to make the server misbehave.
//!    * Inspect every WRITE the server applied via `remote.writes()`.
//!
//! *  Every connection made through [`FakeFactory`] talks to the same
//!    [`FakeRemote`], so a reconnect sees the files the previous session wrote.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use sftp_core::connections::{Credential, SftpError, Transport, TransportFactory};
use sftp_core::protocol::{
    decode_client_packet, encode_check_file_reply, encode_response, encode_version, ClientPacket,
    DirEntry, FileAttrs, OpenFlags, Request, Response, StatusCode, CHECK_FILE_HANDLE,
};
use sftp_core::storage::ConnectionProfile;
use tokio::sync::mpsc;

pub const HOME: &str = "/home/test";

type Inbound = mpsc::UnboundedSender<Result<Bytes, SftpError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hold {
    #[default]
    Off,
    /// Apply writes but keep their responses back.
    Writes,
    /// Keep back every response.
    All,
}

/// Knobs for making the server misbehave.
#[derive(Debug, Default)]
pub struct Faults {
    pub unreachable: bool,
    pub reject_auth: bool,
    pub connect_delay: Option<Duration>,
    /// Swallow every request without answering.
    pub silent: bool,
    pub no_check_file: bool,
    pub corrupt_digest: bool,
    /// Never answer the next N writes at this offset.
    pub drop_write_responses: Option<(u64, u32)>,
    /// Kill the connection when the N-th write request arrives (1-based,
    /// counted over all connections). That write is not applied.
    pub disconnect_on_write: Option<usize>,
    pub hold: Hold,
    /// Cap on the bytes returned by one READ.
    pub max_read: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub connection: usize,
    pub offset: u64,
    pub len: usize,
}

enum OpenHandle {
    File(String),
    Dir { path: String, listed: bool },
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    handles: HashMap<Bytes, OpenHandle>,
    next_handle: u32,
    writes: Vec<WriteRecord>,
    write_requests: usize,
    connections: usize,
    links: Vec<Inbound>,
    held: Vec<(Inbound, Bytes)>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = FakeRemote::default();
        lock(&remote.state).dirs.insert(HOME.to_string());
        Arc::new(remote)
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        lock(&self.faults)
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        lock(&self.state).files.insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).cloned()
    }

    pub fn mkdir(&self, path: &str) {
        lock(&self.state).dirs.insert(path.to_string());
    }

    pub fn has_dir(&self, path: &str) -> bool {
        lock(&self.state).dirs.contains(path)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state).writes.clone()
    }

    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.state).handles.len()
    }

    pub fn held(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Deliver held responses, optionally newest first, and stop holding.
    pub fn release_held(&self, newest_first: bool) {
        self.faults().hold = Hold::Off;
        let mut held = std::mem::take(&mut lock(&self.state).held);
        if newest_first {
            held.reverse();
        }
        for (link, packet) in held {
            let _ = link.send(Ok(packet));
        }
    }

    /// Push a response nobody asked for into connection `connection` (1-based).
    pub fn inject(&self, connection: usize, id: u32, response: &Response) {
        let state = lock(&self.state);
        if let Some(link) = state.links.get(connection - 1) {
            let _ = link.send(Ok(encode_response(id, response)));
        }
    }

    /// Wait until `check` holds, polling.
    pub async fn until(&self, what: &str, check: impl Fn(&FakeRemote) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn attrs_of(state: &State, path: &str) -> Option<FileAttrs> {
        if let Some(data) = state.files.get(path) {
            Some(FileAttrs {
                size: Some(data.len() as u64),
                permissions: Some(0o100644),
                ..FileAttrs::default()
            })
        } else if state.dirs.contains(path) {
            Some(FileAttrs {
                size: Some(4096),
                permissions: Some(0o040755),
                ..FileAttrs::default()
            })
        } else {
            None
        }
    }

    fn new_handle(state: &mut State, open: OpenHandle) -> Bytes {
        state.next_handle += 1;
        let handle = Bytes::from(format!("h{}", state.next_handle));
        state.handles.insert(handle.clone(), open);
        handle
    }

    fn file_of<'a>(state: &'a mut State, handle: &Bytes) -> Result<&'a mut Vec<u8>, Response> {
        let path = match state.handles.get(handle) {
            Some(OpenHandle::File(path)) => path.clone(),
            _ => return Err(Response::status(StatusCode::Failure, "bad handle")),
        };
        state
            .files
            .get_mut(&path)
            .ok_or_else(|| Response::status(StatusCode::NoSuchFile, "file vanished"))
    }

    /// Execute one request against the file system.
    fn serve(&self, connection: usize, request: Request) -> Response {
        let faults = self.faults();
        let mut state = lock(&self.state);
        let state = &mut *state;
        let ok = Response::ok();
        let missing = || Response::status(StatusCode::NoSuchFile, "no such file");

        match request {
            Request::Open { path, flags, .. } => {
                if flags.contains(OpenFlags::WRITE) {
                    let exists = state.files.contains_key(&path);
                    if !exists && !flags.contains(OpenFlags::CREATE) {
                        return missing();
                    }
                    let file = state.files.entry(path.clone()).or_default();
                    if flags.contains(OpenFlags::TRUNCATE) {
                        file.clear();
                    }
                } else if !state.files.contains_key(&path) {
                    return missing();
                }
                Response::Handle(Self::new_handle(state, OpenHandle::File(path)))
            }
            Request::Close { handle } => match state.handles.remove(&handle) {
                Some(_) => ok,
                None => Response::status(StatusCode::Failure, "bad handle"),
            },
            Request::Read {
                handle,
                offset,
                len,
            } => {
                let cap = faults.max_read.unwrap_or(usize::MAX);
                match Self::file_of(state, &handle) {
                    Ok(file) => {
                        let offset = offset as usize;
                        if offset >= file.len() {
                            return Response::status(StatusCode::Eof, "eof");
                        }
                        let end = file.len().min(offset + (len as usize).min(cap));
                        Response::Data(Bytes::copy_from_slice(&file[offset..end]))
                    }
                    Err(status) => status,
                }
            }
            Request::Write {
                handle,
                offset,
                data,
            } => match Self::file_of(state, &handle) {
                Ok(file) => {
                    let start = offset as usize;
                    if file.len() < start + data.len() {
                        file.resize(start + data.len(), 0);
                    }
                    file[start..start + data.len()].copy_from_slice(&data);
                    state.writes.push(WriteRecord {
                        connection,
                        offset,
                        len: data.len(),
                    });
                    ok
                }
                Err(status) => status,
            },
            Request::Fstat { handle } => match state.handles.get(&handle) {
                Some(OpenHandle::File(path)) | Some(OpenHandle::Dir { path, .. }) => {
                    let path = path.clone();
                    Self::attrs_of(state, &path).map(Response::Attrs).unwrap_or_else(missing)
                }
                None => Response::status(StatusCode::Failure, "bad handle"),
            },
            Request::Stat { path } => Self::attrs_of(state, &path)
                .map(Response::Attrs)
                .unwrap_or_else(missing),
            Request::Opendir { path } => {
                if !state.dirs.contains(&path) {
                    return missing();
                }
                Response::Handle(Self::new_handle(
                    state,
                    OpenHandle::Dir {
                        path,
                        listed: false,
                    },
                ))
            }
            Request::Readdir { handle } => {
                let path = match state.handles.get_mut(&handle) {
                    Some(OpenHandle::Dir { listed: true, .. }) => {
                        return Response::status(StatusCode::Eof, "eof")
                    }
                    Some(OpenHandle::Dir { path, listed }) => {
                        *listed = true;
                        path.clone()
                    }
                    _ => return Response::status(StatusCode::Failure, "bad handle"),
                };
                let prefix = format!("{}/", path.trim_end_matches('/'));
                let mut names: Vec<String> = state
                    .files
                    .keys()
                    .chain(state.dirs.iter())
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                    .map(str::to_string)
                    .collect();
                names.sort();
                let mut entries = vec![dot("."), dot("..")];
                for name in names {
                    let attrs = Self::attrs_of(state, &format!("{prefix}{name}")).unwrap_or_default();
                    entries.push(DirEntry {
                        long_name: name.clone(),
                        name,
                        attrs,
                    });
                }
                Response::Name(entries)
            }
            Request::Remove { path } => match state.files.remove(&path) {
                Some(_) => ok,
                None => missing(),
            },
            Request::Mkdir { path, .. } => {
                if state.dirs.contains(&path) || state.files.contains_key(&path) {
                    Response::status(StatusCode::Failure, "already exists")
                } else {
                    state.dirs.insert(path);
                    ok
                }
            }
            Request::Rmdir { path } => match state.dirs.remove(&path) {
                true => ok,
                false => missing(),
            },
            Request::Realpath { path } => {
                let resolved = match path.as_str() {
                    "." | "" => HOME.to_string(),
                    p if p.starts_with('/') => p.to_string(),
                    p => format!("{HOME}/{p}"),
                };
                Response::Name(vec![DirEntry {
                    name: resolved.clone(),
                    long_name: resolved,
                    attrs: FileAttrs::default(),
                }])
            }
            Request::CheckFile { handle, .. } => {
                if faults.no_check_file {
                    return Response::status(StatusCode::OpUnsupported, "check-file unsupported");
                }
                match Self::file_of(state, &handle) {
                    Ok(file) => {
                        let mut hash = Sha256::digest(&file[..]).to_vec();
                        if faults.corrupt_digest {
                            hash[0] ^= 0xff;
                        }
                        Response::ExtendedReply(encode_check_file_reply("sha256", &hash))
                    }
                    Err(status) => status,
                }
            }
        }
    }
}

fn dot(name: &str) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        long_name: name.to_string(),
        attrs: FileAttrs::default(),
    }
}

/// One connection to a [`FakeRemote`].
pub struct FakeTransport {
    remote: Arc<FakeRemote>,
    connection: usize,
    inbound_tx: Inbound,
    inbound_rx: mpsc::UnboundedReceiver<Result<Bytes, SftpError>>,
    alive: bool,
}

impl FakeTransport {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            connection: 0,
            inbound_tx,
            inbound_rx,
            alive: false,
        }
    }

    fn reply(&self, body: Bytes) {
        let _ = self.inbound_tx.send(Ok(body));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self) -> Result<(), SftpError> {
        let (unreachable, delay) = {
            let faults = self.remote.faults();
            (faults.unreachable, faults.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(SftpError::Unreachable("connection refused".into()));
        }
        let mut state = lock(&self.remote.state);
        state.connections += 1;
        state.links.push(self.inbound_tx.clone());
        self.connection = state.connections;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), SftpError> {
        Ok(())
    }

    async fn authenticate(
        &mut self,
        username: &str,
        _credential: &Credential,
    ) -> Result<(), SftpError> {
        if self.remote.faults().reject_auth {
            return Err(SftpError::AuthRejected {
                username: username.to_string(),
                host: "fake".into(),
                reason: "bad password".into(),
            });
        }
        Ok(())
    }

    async fn start_subsystem(&mut self) -> Result<(), SftpError> {
        self.alive = true;
        Ok(())
    }

    async fn write_packet(&mut self, packet: Bytes) -> Result<(), SftpError> {
        if !self.alive {
            // A reset link loses whatever is still written; the reset itself
            // is already queued behind the earlier replies.
            return Ok(());
        }
        let (id, request) = match decode_client_packet(&packet)? {
            ClientPacket::Init { .. } => {
                let extensions: &[(&str, &str)] = if self.remote.faults().no_check_file {
                    &[]
                } else {
                    &[(CHECK_FILE_HANDLE, "1")]
                };
                self.reply(encode_version(3, extensions));
                return Ok(());
            }
            ClientPacket::Request { id, request } => (id, request),
        };

        let is_write = matches!(request, Request::Write { .. });
        let mut answer = true;
        let mut hold = false;
        {
            let mut faults = self.remote.faults();
            if faults.silent {
                return Ok(());
            }
            if let Request::Write { offset, .. } = &request {
                let seen = {
                    let mut state = lock(&self.remote.state);
                    state.write_requests += 1;
                    state.write_requests
                };
                if let Some(n) = faults.disconnect_on_write {
                    if seen >= n {
                        faults.disconnect_on_write = None;
                        self.alive = false;
                        let _ = self
                            .inbound_tx
                            .send(Err(SftpError::Protocol("connection reset by peer".into())));
                        return Ok(());
                    }
                }
                if let Some((at, remaining)) = faults.drop_write_responses {
                    if at == *offset && remaining > 0 {
                        faults.drop_write_responses = Some((at, remaining - 1));
                        answer = false;
                    }
                }
            }
            hold = match faults.hold {
                Hold::Off => false,
                Hold::Writes => is_write,
                Hold::All => true,
            };
        }

        let response = self.remote.serve(self.connection, request);
        let body = encode_response(id, &response);
        if !answer {
            return Ok(());
        }
        if hold {
            lock(&self.remote.state)
                .held
                .push((self.inbound_tx.clone(), body));
        } else {
            self.reply(body);
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Bytes, SftpError> {
        match self.inbound_rx.recv().await {
            Some(inbound) => inbound,
            None => Err(SftpError::SessionClosed),
        }
    }

    async fn disconnect(&mut self) -> Result<(), SftpError> {
        self.alive = false;
        Ok(())
    }
}

/// Hands the registry connections to one shared [`FakeRemote`].
pub struct FakeFactory {
    pub remote: Arc<FakeRemote>,
}

impl TransportFactory for FakeFactory {
    fn create(&self, _profile: &ConnectionProfile) -> Box<dyn Transport> {
        Box::new(FakeTransport::new(self.remote.clone()))
    }
}
