use crate::connections::{errors::SftpError, transport::Credential, transport::Transport};
use crate::protocol::{frame, PacketAssembler};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use log::{debug, error, info};
use ssh2::{Channel, Session};

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    thread,
    time::Duration,
};
use tokio::sync::mpsc;

type Inbound = Result<Bytes, SftpError>;

/// SFTP over an SSH session channel, backed by libssh2.
///
/// libssh2 is blocking, so the connect steps run on the blocking pool and,
/// once the `sftp` subsystem is up, a worker thread owns the session and
/// shuttles framed packets between the channel and two tokio channels.
pub struct SshTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,

    tcp: Option<TcpStream>,
    session: Option<Session>,

    write_tx: Option<mpsc::Sender<Bytes>>,
    read_rx: Option<mpsc::UnboundedReceiver<Inbound>>,

    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SshTransport {
    pub fn new(host: String, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host,
            port,
            connect_timeout,
            tcp: None,
            session: None,
            write_tx: None,
            read_rx: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn take_session(&mut self) -> Result<Session, SftpError> {
        self.session
            .take()
            .ok_or_else(|| SftpError::Protocol("SSH session not established".into()))
    }
}

async fn blocking<T, F>(work: F) -> Result<T, SftpError>
where
    F: FnOnce() -> Result<T, SftpError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SftpError::Protocol(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&mut self) -> Result<(), SftpError> {
        let addr = format!("{}:{}", self.host, self.port);
        let timeout = self.connect_timeout;
        info!("Connecting to SSH server at {}", addr);

        let tcp = blocking(move || {
            let candidates = addr
                .to_socket_addrs()
                .map_err(|e| SftpError::Unreachable(format!("cannot resolve {addr}: {e}")))?;
            let mut last_error = None;
            for candidate in candidates {
                match TcpStream::connect_timeout(&candidate, timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(SftpError::Unreachable(match last_error {
                Some(e) => format!("{addr}: {e}"),
                None => format!("{addr}: no addresses"),
            }))
        })
        .await?;

        self.tcp = Some(tcp);
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), SftpError> {
        let tcp = self
            .tcp
            .take()
            .ok_or_else(|| SftpError::Protocol("socket not open".into()))?;
        let timeout_ms = self.connect_timeout.as_millis().min(u32::MAX as u128) as u32;

        let session = blocking(move || {
            let mut session = Session::new()
                .map_err(|e| SftpError::Protocol(format!("failed to create SSH session: {e}")))?;
            session.set_timeout(timeout_ms);
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| SftpError::Protocol(format!("handshake error: {e}")))?;
            Ok(session)
        })
        .await?;

        debug!("SSH handshake with {}:{} complete", self.host, self.port);
        self.session = Some(session);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        username: &str,
        credential: &Credential,
    ) -> Result<(), SftpError> {
        let session = self.take_session()?;
        let username = username.to_string();
        let host = self.host.clone();
        let credential = credential.clone();

        let session = blocking(move || {
            let rejected = |reason: String| SftpError::AuthRejected {
                username: username.clone(),
                host: host.clone(),
                reason,
            };
            let result = match &credential {
                Credential::Password(password) => session.userauth_password(&username, password),
                Credential::KeyFile { path, passphrase } => {
                    session.userauth_pubkey_file(&username, None, path, passphrase.as_deref())
                }
                Credential::Agent => session.userauth_agent(&username),
            };
            result.map_err(|e| rejected(e.to_string()))?;
            if !session.authenticated() {
                return Err(rejected("server did not accept the credential".into()));
            }
            Ok(session)
        })
        .await?;

        self.session = Some(session);
        Ok(())
    }

    async fn start_subsystem(&mut self) -> Result<(), SftpError> {
        let session = self.take_session()?;

        let (session, channel) = blocking(move || {
            let mut channel = session
                .channel_session()
                .map_err(|e| SftpError::Protocol(format!("channel error: {e}")))?;
            channel
                .subsystem("sftp")
                .map_err(|e| SftpError::Protocol(format!("sftp subsystem refused: {e}")))?;
            Ok((session, channel))
        })
        .await?;
        session.set_blocking(false);

        let (write_tx, write_rx) = mpsc::channel::<Bytes>(64);
        // Unbounded so the worker never blocks on a busy I/O loop while that
        // loop is itself waiting to hand the worker an outgoing packet.
        let (read_tx, read_rx) = mpsc::unbounded_channel::<Inbound>();
        let stop = self.stop.clone();

        let worker = thread::spawn(move || io_worker(session, channel, write_rx, read_tx, stop));

        info!("SFTP channel established to {}:{}", self.host, self.port);
        self.write_tx = Some(write_tx);
        self.read_rx = Some(read_rx);
        self.worker = Some(worker);
        Ok(())
    }

    async fn write_packet(&mut self, packet: Bytes) -> Result<(), SftpError> {
        match &self.write_tx {
            Some(tx) => tx
                .send(frame(&packet))
                .await
                .map_err(|_| SftpError::SessionClosed),
            None => Err(SftpError::SessionClosed),
        }
    }

    async fn read_packet(&mut self) -> Result<Bytes, SftpError> {
        match &mut self.read_rx {
            Some(rx) => match rx.recv().await {
                Some(inbound) => inbound,
                None => Err(SftpError::SessionClosed),
            },
            None => Err(SftpError::SessionClosed),
        }
    }

    async fn disconnect(&mut self) -> Result<(), SftpError> {
        self.stop.store(true, Ordering::SeqCst);
        self.write_tx = None; // tell worker to exit
        self.read_rx = None;
        self.session = None;
        self.tcp = None;
        if let Some(jh) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || jh.join()).await;
        }
        Ok(())
    }
}

/// Blocking I/O loop: owns the libssh2 session for the channel's lifetime.
fn io_worker(
    session: Session,
    mut channel: Channel,
    mut write_rx: mpsc::Receiver<Bytes>,
    read_tx: mpsc::UnboundedSender<Inbound>,
    stop: Arc<AtomicBool>,
) {
    let mut assembler = PacketAssembler::default();
    let mut outgoing: Option<Bytes> = None;
    let mut buf = vec![0u8; 64 * 1024];

    let fail = |e: SftpError| {
        error!("SFTP channel error: {}", e);
        let _ = read_tx.send(Err(e));
    };

    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        // outgoing
        if outgoing.is_none() {
            match write_rx.try_recv() {
                Ok(pkt) => outgoing = Some(pkt),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
        if let Some(pkt) = outgoing.as_mut() {
            match channel.write(&pkt[..]) {
                Ok(n) => {
                    pkt.advance(n);
                    progressed = n > 0;
                    if pkt.is_empty() {
                        outgoing = None;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return fail(e.into()),
            }
        }

        // incoming
        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    return fail(SftpError::Protocol("server closed the sftp channel".into()));
                }
            }
            Ok(n) => {
                progressed = true;
                assembler.extend(&buf[..n]);
                loop {
                    match assembler.next_packet() {
                        Ok(Some(packet)) => {
                            if read_tx.send(Ok(packet)).is_err() {
                                return; // receiver gone
                            }
                        }
                        Ok(None) => break,
                        Err(e) => return fail(e),
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return fail(e.into()),
        }

        if !progressed {
            thread::sleep(Duration::from_millis(2));
        }
    }

    let _ = channel.close();
    drop(session);
    debug!("SFTP worker thread stopped");
}
