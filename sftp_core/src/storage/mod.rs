pub mod profile;
pub mod store;

pub use profile::{ConnectionProfile, CredentialRef, SavedConnection};
pub use store::ProfileStore;
