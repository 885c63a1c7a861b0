//! Echelon Trading Engine Library
//!
//! This library provides the core components for the Echelon automated
//! position management system: signal intake, the trade lifecycle engine,
//! exchange event reconciliation, and durable trade storage.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
