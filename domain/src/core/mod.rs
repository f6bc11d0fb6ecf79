//! Core domain concepts shared across all subdomains.
//!
//! - [`ids::WireId`]: client-supplied identifiers echoed back verbatim
//! - [`error::DomainError`]: domain-level errors

pub mod error;
pub mod ids;
