//! # Storage Module
//!
//! Durable storage for a Bitsave node. The core keeps its state in memory;
//! this module makes the event log survive restarts.
//!
//! ```text
//! db.rs: sled-backed event log and deployment metadata
//! ```

pub mod db;

pub use db::{BitsaveDB, DbError, DbResult};
