//! Request parsing and validation.
//!
//! The authorization endpoint accepts parameters from three sources, merged
//! in a fixed order (later overrides earlier):
//!
//! 1. the HTTP form body (POST) or query string (GET),
//! 2. a `request_uri`: either a pushed authorization request (consumed
//!    from the PAR store) or, when enabled, an HTTPS reference fetched with
//!    the SSRF guard,
//! 3. a `request` JWT (JAR), decrypted if necessary and verified against
//!    the client's keys.
//!
//! After merging, the validation ladder resolves the client and redirect
//! URI first: everything that fails afterwards is delivered as an OAuth
//! error redirect, everything before is rendered to the user agent.

pub mod fetch;
pub mod jar;
pub mod rar;
pub mod types;
pub mod validate;

pub use fetch::OutboundFetcher;
pub use types::{PromptSet, ResponseMode, ResponseTypeSet};
pub use validate::{AuthorizeReject, RawParams, RequestValidator, ValidatedAuthRequest};
