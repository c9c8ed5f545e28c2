//! Keel Core - Shared types, error taxonomy, configuration and wire protocol
//!
//! This crate contains the foundational types used by the Keel driver, its
//! backends and the reference store. It has no dependencies on networking or
//! async runtime code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{Config, ConfigError, DriverConfig, NetworkConfig, StoreConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Default store port
pub const DEFAULT_PORT: u16 = 1247;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Largest payload of a single read or write request (1 MB)
pub const MAX_TRANSFER_SIZE: usize = 1024 * 1024;

/// Maximum message size: one full transfer plus framing
pub const MAX_MESSAGE_SIZE: usize = MAX_TRANSFER_SIZE + 64 * 1024;

/// Length of a binary object digest
pub const DIGEST_LEN: usize = 16;
