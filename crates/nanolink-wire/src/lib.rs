//! nanolink wire protocol: framed, optionally encrypted message channels
//! between processes, plus a lightweight discovery registry.
//!
//! ## Architecture
//!
//! - **FrameCodec**: preamble + length-prefixed frames, plain or sealed
//! - **SecureConnection**: one socket pumped by a receive loop and a send loop
//! - **ConnectionBuilder**: validated assembly of connection parameters
//! - **DiscoveryRegistry**: accepts registrations, indexes them, sweeps dead ones
//! - **ServiceEndpoint**: dial, probe and register a [`ServiceDescriptor`]

pub mod builder;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod keys;
pub mod registry;
pub mod service;

pub use builder::ConnectionBuilder;
pub use codec::{FrameCodec, PREAMBLE};
pub use connection::{ConnectionSettings, SecureConnection};
pub use keys::{SessionKeys, WireKey};
pub use registry::DiscoveryRegistry;
pub use service::{fetch_registry, ServiceEndpoint};

pub use nanolink_types::{DescriptorBatch, ServiceDescriptor, WireError, WireResult};
