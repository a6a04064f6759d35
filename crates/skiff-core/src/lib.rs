//! # skiff-core
//!
//! Shared infrastructure for the skiff transfer engine: the
//! categorised error type, engine configuration, and the injected
//! credential-provider seam.

pub mod config;
pub mod credentials;
pub mod error;

pub use config::{EngineConfig, HostKeyPolicy};
pub use credentials::{Credential, CredentialProvider, Endpoint, StaticCredentialProvider};
pub use error::{validate_entry_name, EngineError, EngineResult, ErrorKind};
