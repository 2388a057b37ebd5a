//! # Server Registry
//!
//! Business rules for publishing and querying versioned server descriptors,
//! on top of the pluggable stores in the `store` crate.
//!
//! ## Features
//!
//! - Publish with a per-name lock, so exactly one version is ever latest
//! - Edit payloads and change version status
//! - Cursor-paginated listings with filters
//! - Seed import at startup
//! - Optional hot reload of the embedded store from object storage
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryService;
//! use store::{JsonFileStore, ServerJson, Store};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = JsonFileStore::open("/var/lib/registry/servers.json").await?;
//! let registry = RegistryService::new(Store::new(store));
//!
//! registry
//!     .publish(ServerJson::new("io.github.example/weather", "1.0.0"))
//!     .await?;
//! let latest = registry.get_latest("io.github.example/weather").await?;
//! assert_eq!(latest.version(), "1.0.0");
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod seed;
mod service;

pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use seed::SeedReport;
pub use service::{validate_name, RegistryService, DEFAULT_LIMIT, MAX_LIMIT};
