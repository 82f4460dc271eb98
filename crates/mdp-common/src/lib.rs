//! MDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the marine data platform.
//!
//! # Overview
//!
//! This crate provides common functionality used across all MDP workspace members:
//!
//! - **Types**: raw records, canonical observations, rejections and geo helpers
//! - **Checksums**: stable payload digests used for provenance and deduplication
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Error Handling**: Custom error types and result types
//!
//! # Example
//!
//! ```no_run
//! use mdp_common::checksum::payload_digest;
//!
//! let payload = serde_json::json!({"id": "a1", "decimalLatitude": 30.5});
//! let digest = payload_digest(&payload).unwrap();
//! assert_eq!(digest.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{MdpError, Result};
