//! MARGIN Sync - client-side data layer
//!
//! Optimistic entity stores with snapshot rollback, the local-draft
//! lifecycle, debounced autosave, the remote client contract with its REST
//! and in-memory implementations, and the session that wires them to the
//! storage crate.

mod config;
mod debounce;
mod draft;
mod error;
pub mod mock;
mod remote;
mod rest;
mod session;
mod store;
mod telemetry;

pub use config::{AuthConfig, ClientConfig, ConfigError, CONFIG_ENV_VAR};
pub use debounce::Debouncer;
pub use draft::DraftStore;
pub use error::{ClientError, ClientResult};
pub use remote::RemoteClient;
pub use rest::{HttpTransport, RestRemote};
pub use session::{Remotes, Session, SharedDrafts, SharedStore};
pub use store::{EntityStore, Snapshot};
pub use telemetry::init_tracing;
