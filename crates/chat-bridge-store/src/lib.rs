//! Credential storage and connection supervision.
//!
//! Provides:
//! - Storage backends (memory, MongoDB, PostgreSQL) behind `CredentialStore`
//! - `ConnectionSupervisor` - Establish, watch and re-establish the connection

pub mod storage;
pub mod supervisor;

pub use storage::{StoreConfig, open_store};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorError, SupervisorStatus};
