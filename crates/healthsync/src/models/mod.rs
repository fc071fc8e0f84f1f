//! Domain models for the sync engine

mod credentials;
mod ids;
mod sample;
mod session;

pub use credentials::{Credentials, PluginSettings, normalize_auth_header};
pub use ids::{Cursor, DataTypeId, UserKey};
pub use sample::{ReadBatch, ReadRequest, Sample, SourceInfo};
pub use session::{SyncSessionState, TypeProgress};
