//! Core types for nanolink.
//!
//! Shared data structures used by the wire crate and the CLI: service
//! descriptors and batches, the error taxonomy, and configuration. This crate
//! does no networking.

pub mod config;
pub mod descriptor;
pub mod error;

pub use config::{KeyConfig, NanoConfig, RegistryConfig, TransportConfig};
pub use descriptor::{DescriptorBatch, ServiceDescriptor, ALL_SERVICES};
pub use error::{ErrorKind, WireError, WireResult};
