//! Storage traits and implementations
//!
//! Anchors and the resumable session live behind [`AnchorStore`] and
//! [`SessionStore`]; credentials and plugin settings behind
//! [`CredentialStore`]. Each trait has an in-memory implementation for tests
//! and a persistent one for devices.

mod credentials_file;
mod memory;
mod sqlite;
mod traits;

pub use credentials_file::FileCredentialStore;
pub use memory::{InMemoryCredentialStore, InMemorySyncStore};
pub use sqlite::SqliteSyncStore;
pub use traits::{AnchorStore, CredentialStore, SessionStore};
