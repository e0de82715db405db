//! Storage traits for relational auth data.
//!
//! The core issues queries through these interfaces only; the backing
//! engines (one non-PII store, one PII store) are external collaborators.
//! In-memory implementations live in the `authrim-store-memory` crate.

mod client;
mod consent;
mod identity_provider;
mod linked_identity;
mod passkey;
mod saml_replay;
mod session_client;
mod user;

pub use client::ClientStore;
pub use consent::ConsentStore;
pub use identity_provider::{IdentityProvider, IdentityProviderStore};
pub use linked_identity::{LinkedIdentity, LinkedIdentityStore};
pub use passkey::{PasskeyCredential, PasskeyStore};
pub use saml_replay::SamlReplayStore;
pub use session_client::SessionClientStore;
pub use user::{NewUser, UserStore};
