//! # authrim-state
//!
//! The sharded ephemeral-state layer: a router that maps logical keys onto
//! shard instances, and the six actor kinds that own short-lived
//! authorization state.
//!
//! ## Actor model
//!
//! Each actor is a single-writer owner of its slice of state. Callers never
//! mutate actor state directly; they invoke the named operations on the
//! actor interfaces defined here. Operations within one actor are serialized
//! (the in-memory implementations hold a per-shard lock only across the map
//! operation, never across an await of untrusted duration); operations
//! across actors run in parallel.
//!
//! Every operation is idempotent or explicitly single-use. Single-use
//! consumption (`consume_code`, `consume_request`, `consume_challenge`) is
//! atomic read-and-delete: the second consumer observes a distinct error.
//!
//! ## Actor kinds
//!
//! | Actor | Owns | Routing |
//! |---|---|---|
//! | [`AuthCodeStore`] | authorization codes | `hash(user ‖ client) mod n`, session-locality override |
//! | [`ParRequestStore`] | pushed authorization requests | shard index inside the request URI |
//! | [`ChallengeStore`] | login/consent/authenticator challenges | `hash(challenge_id) mod n` |
//! | [`SessionStore`] | browser sessions | shard index inside the session id |
//! | [`RateLimiter`] | fixed-window counters | bucket name |
//! | [`KeyManager`] | the active signing key | single global instance |

pub mod auth_code;
pub mod challenge;
pub mod dpop_jti;
pub mod error;
pub mod key_manager;
pub mod par;
pub mod rate_limit;
pub mod router;
pub mod session;

pub use auth_code::{AuthCodeRecord, AuthCodeStore, InMemoryAuthCodeShards, ShardStatus};
pub use challenge::{
    AuthRequestSnapshot, ChallengeKind, ChallengePayload, ChallengeRecord, ChallengeStore,
    InMemoryChallengeStore,
};
pub use dpop_jti::{DpopJtiStore, InMemoryDpopJtiStore};
pub use error::StateError;
pub use key_manager::{ActiveKey, KeyManager};
pub use par::{InMemoryParRequestStore, ParRecord, ParRequestStore};
pub use rate_limit::{InMemoryRateLimiter, RateLimitDecision, RateLimiter};
pub use router::{ActorAddress, ShardRouter};
pub use session::{InMemorySessionStore, SessionRecord, SessionStore};

/// Result alias for state operations.
pub type StateResult<T> = Result<T, StateError>;
