//! # flotta-id
//!
//! Identifier types for the flotta edge agent.
//!
//! ## Design Principles
//!
//! - Identifiers are validated on construction and never change afterwards
//! - Every identifier has a canonical string form with strict parsing
//! - Identifiers roundtrip through serde as plain strings
//!
//! ## Identifier Kinds
//!
//! - [`DeviceId`]: identity of the host the agent runs on. Taken from the
//!   machine identity when available, otherwise a generated UUID.
//! - [`WorkloadId`]: SHA-256 content digest of a workload, 64 lowercase hex
//!   characters. Two workloads with the same digest are the same workload.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
