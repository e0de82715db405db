//! # authrim-core
//!
//! Core types shared by every Authrim crate.
//!
//! This crate provides:
//! - Sharded identifiers (session ids, authorization codes, PAR request URIs)
//!   whose shard index is embedded in the identifier itself
//! - Redirect URI normalization used for registered-URI matching
//! - Time helpers for expiry checks with bounded clock skew
//!
//! ## Sharded identifiers
//!
//! Ephemeral state (sessions, authorization codes, pushed authorization
//! requests) lives on single-writer shards. Identifiers embed their shard
//! index so that a shard-count reload never strands in-flight state: the id
//! itself says where it lives, and the router only uses the configured count
//! when *assigning* new ids.

pub mod id;
pub mod time;
pub mod url;

pub use id::{AuthCode, IdError, ParRequestUri, SessionId};
pub use time::{is_expired, is_expired_with_skew, now_unix};
pub use url::{normalize_redirect_uri, redirect_uri_matches};

/// Result alias for core parsing operations.
pub type CoreResult<T> = Result<T, IdError>;
