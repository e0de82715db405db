//! Time helpers.
//!
//! All expiry bookkeeping uses unix seconds (`i64`). Assertions arriving
//! from external parties (SAML, DPoP proofs) are checked with a bounded
//! clock-skew allowance.

use time::OffsetDateTime;

/// Default clock-skew allowance in seconds for externally-issued assertions.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 60;

/// Current time as unix seconds.
#[must_use]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Returns `true` if `expires_at` (unix seconds) is in the past.
#[must_use]
pub fn is_expired(expires_at: i64) -> bool {
    expires_at <= now_unix()
}

/// Returns `true` if `expires_at` is in the past beyond the skew allowance.
///
/// With a 60 s skew, an assertion 59 s past expiry is still accepted and
/// one 61 s past expiry is rejected.
#[must_use]
pub fn is_expired_with_skew(expires_at: i64, skew_secs: i64) -> bool {
    expires_at + skew_secs <= now_unix()
}

/// Returns `true` if `not_before` is in the future beyond the skew allowance.
#[must_use]
pub fn is_premature_with_skew(not_before: i64, skew_secs: i64) -> bool {
    not_before - skew_secs > now_unix()
}
