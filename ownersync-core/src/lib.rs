pub mod config;
pub mod mappings;
pub mod sentry;
pub mod sync;

pub use config::*;
pub use mappings::*;
pub use sentry::*;
pub use sync::{member_ids_by_email, run, OwnershipApi, SyncError, SyncReport};
