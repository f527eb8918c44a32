//! Command implementations by domain.

pub mod keys;
pub mod registry;
pub mod service;
