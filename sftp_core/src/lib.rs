pub mod config;
pub mod connections;
pub mod core;
pub mod events;
pub mod protocol;
pub mod storage;
pub mod utils;

// re-export ergonomic entry points
pub use config::{ClientConfig, SessionConfig};
pub use connections::{Credential, SftpError, Transport, TransportFactory};
pub use crate::core::{
    ConnectionRegistry, Session, SessionStatus, Transfer, TransferEngine, TransferOptions,
    TransferState,
};
pub use events::{LifecycleEvent, Notification, TransferEvent};
pub use storage::{ConnectionProfile, CredentialRef, ProfileStore};
