use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connections::errors::SftpError;
use crate::storage::profile::ConnectionProfile;

/// A secret ready to be presented to the server.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(..)"),
            Credential::KeyFile { path, .. } => write!(f, "KeyFile({})", path.display()),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// A packet-oriented channel to an SFTP server.
///
/// Connecting is split into the steps the session drives one by one
/// (`open` → `handshake` → `authenticate` → `start_subsystem`), so that a
/// failure or a deadline can be attributed to a named phase.
///
/// Packets handed to `write_packet` and returned by `read_packet` are bodies
/// without the length prefix; framing is the transport's job.
#[async_trait]
pub trait Transport: Send {
    /// Establish the underlying socket.
    async fn open(&mut self) -> Result<(), SftpError>;

    /// Protocol version and key exchange.
    async fn handshake(&mut self) -> Result<(), SftpError>;

    async fn authenticate(
        &mut self,
        username: &str,
        credential: &Credential,
    ) -> Result<(), SftpError>;

    /// Open the channel that carries SFTP packets.
    async fn start_subsystem(&mut self) -> Result<(), SftpError>;

    async fn write_packet(&mut self, packet: Bytes) -> Result<(), SftpError>;

    /// Next complete packet from the server. Must be cancel-safe: the I/O
    /// loop races it against outgoing work in `tokio::select!`.
    async fn read_packet(&mut self) -> Result<Bytes, SftpError>;

    async fn disconnect(&mut self) -> Result<(), SftpError>;
}

/// Creates fresh, not-yet-connected transports for profiles.
pub trait TransportFactory: Send + Sync {
    fn create(&self, profile: &ConnectionProfile) -> Box<dyn Transport>;
}

/// Builds ssh2-backed transports.
#[cfg(feature = "ssh")]
#[derive(Debug, Clone)]
pub struct SshTransportFactory {
    connect_timeout: std::time::Duration,
}

#[cfg(feature = "ssh")]
impl SshTransportFactory {
    pub fn new(connect_timeout: std::time::Duration) -> Self {
        Self { connect_timeout }
    }
}

#[cfg(feature = "ssh")]
impl TransportFactory for SshTransportFactory {
    fn create(&self, profile: &ConnectionProfile) -> Box<dyn Transport> {
        Box::new(crate::connections::ssh::SshTransport::new(
            profile.host.clone(),
            profile.port,
            self.connect_timeout,
        ))
    }
}
