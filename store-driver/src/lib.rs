//! # Store driver
//!
//! The storage contract for the server registry: the versioned record model,
//! listing filters and cursors, the publish-lock key, and the traits every
//! backend implements.

mod driver;
mod error;
mod filter;
mod record;

pub use driver::publish_lock_key;
pub use driver::BoxFut;
pub use driver::Driver;
pub use driver::Page;
pub use driver::Records;
pub use driver::Transaction;
pub use error::{StoreError, StoreErrorBuilder, StoreErrorKind};
pub use filter::{Cursor, InvalidCursor, ServerFilter};
pub use record::{touch, RegistryExtensions, Remote, ServerJson, ServerRecord, Status};
