//! Domain types: clients, consents, users.

pub mod client;
pub mod consent;
pub mod user;

pub use client::{Client, ClientAuthMethod, ClientValidationError, DelegationMode};
pub use consent::ConsentRecord;
pub use user::{UserCore, UserInfo, UserPii};
