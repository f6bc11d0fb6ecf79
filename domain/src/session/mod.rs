//! Client session domain.
//!
//! - [`entities::Session`]: one connection's isolated conversation
//! - [`entities::Turn`]: a single exchange entry within a session
//! - [`entities::Identity`]: who the client claims to be

pub mod entities;
