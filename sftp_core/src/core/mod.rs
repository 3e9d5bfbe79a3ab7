pub mod multiplexer;
pub mod registry;
pub mod session;
pub mod transfer;

pub use multiplexer::{Multiplexer, PendingResponse};
pub use registry::ConnectionRegistry;
pub use session::{ConnectPhase, Session, SessionStatus};
pub use transfer::{
    IntegrityCheck, Transfer, TransferDirection, TransferEngine, TransferOptions,
    TransferSnapshot, TransferState,
};
