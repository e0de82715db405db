//! Sharded identifier types.
//!
//! Three identifier families embed their shard index in the wire form:
//!
//! - Session ids: `{shard}_session_{uuid}`
//! - Authorization codes: `{shard}_auth_{random}`
//! - PAR request URIs: `urn:ietf:params:oauth:request_uri:g{gen}:{region}:{shard}:par_{uuid}`
//!
//! Embedding the shard index keeps identifiers resolvable across shard-count
//! reloads: a code minted under an 8-shard configuration remains readable
//! after the count changes, because consumers route on the embedded index
//! rather than re-hashing.

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use uuid::Uuid;

/// Errors that can occur while parsing sharded identifiers.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The identifier does not match the expected wire format.
    #[error("Malformed identifier: {message}")]
    Malformed {
        /// Description of the format violation.
        message: String,
    },

    /// The shard index segment is not a valid integer.
    #[error("Invalid shard index: {segment}")]
    InvalidShardIndex {
        /// The offending segment.
        segment: String,
    },

    /// The embedded UUID segment is not a valid UUID.
    #[error("Invalid UUID segment")]
    InvalidUuid,
}

impl IdError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidShardIndex` error.
    #[must_use]
    pub fn invalid_shard_index(segment: impl Into<String>) -> Self {
        Self::InvalidShardIndex {
            segment: segment.into(),
        }
    }
}

// ============================================================================
// Session id
// ============================================================================

/// A sharded browser-session identifier: `{shard}_session_{uuid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// Shard index this session lives on.
    pub shard: u32,
    /// Unique session UUID.
    pub uuid: Uuid,
}

impl SessionId {
    /// Creates a new session id on the given shard with a random UUID.
    #[must_use]
    pub fn new(shard: u32) -> Self {
        Self {
            shard,
            uuid: Uuid::new_v4(),
        }
    }

    /// Parses a session id from its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `{shard}_session_{uuid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let mut parts = s.splitn(3, '_');
        let shard = parts
            .next()
            .ok_or_else(|| IdError::malformed("empty session id"))?;
        let tag = parts
            .next()
            .ok_or_else(|| IdError::malformed("missing session tag"))?;
        let uuid = parts
            .next()
            .ok_or_else(|| IdError::malformed("missing session uuid"))?;

        if tag != "session" {
            return Err(IdError::malformed(format!("unexpected tag: {tag}")));
        }
        let shard = shard
            .parse::<u32>()
            .map_err(|_| IdError::invalid_shard_index(shard))?;
        let uuid = Uuid::parse_str(uuid).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self { shard, uuid })
    }

    /// Returns `true` if the string looks like a sharded session id.
    ///
    /// Cookies from older deployments may carry opaque values; those are
    /// treated as absent sessions rather than parse errors.
    #[must_use]
    pub fn is_sharded_format(s: &str) -> bool {
        Self::parse(s).is_ok()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_{}", self.shard, self.uuid)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Authorization code
// ============================================================================

/// A sharded authorization code: `{shard}_auth_{random}`.
///
/// The random segment carries 128 bits of entropy (22 base64url characters
/// minimum; we use 32 bytes / 43 characters), making the code globally
/// unique without coordination. Single-use consumption relies on that
/// uniqueness plus the atomic consume of the owning shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthCode {
    /// Shard index this code lives on.
    pub shard: u32,
    /// Random code segment (base64url, no padding).
    pub random: String,
}

impl AuthCode {
    /// Generates a fresh authorization code on the given shard.
    ///
    /// Uses 32 bytes of OS randomness (43 base64url characters).
    #[must_use]
    pub fn generate(shard: u32) -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self {
            shard,
            random: URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// Parses an authorization code from its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `{shard}_auth_{random}` with a
    /// non-empty random segment.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let mut parts = s.splitn(3, '_');
        let shard = parts
            .next()
            .ok_or_else(|| IdError::malformed("empty code"))?;
        let tag = parts.next().ok_or_else(|| IdError::malformed("missing code tag"))?;
        let random = parts
            .next()
            .ok_or_else(|| IdError::malformed("missing code segment"))?;

        if tag != "auth" {
            return Err(IdError::malformed(format!("unexpected tag: {tag}")));
        }
        if random.is_empty() {
            return Err(IdError::malformed("empty code segment"));
        }
        let shard = shard
            .parse::<u32>()
            .map_err(|_| IdError::invalid_shard_index(shard))?;
        Ok(Self {
            shard,
            random: random.to_string(),
        })
    }
}

impl fmt::Display for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_auth_{}", self.shard, self.random)
    }
}

impl FromStr for AuthCode {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// PAR request URI
// ============================================================================

/// URN prefix for pushed authorization request URIs (RFC 9126).
pub const PAR_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// A pushed-authorization-request URI:
/// `urn:ietf:params:oauth:request_uri:g{gen}:{region}:{shard}:par_{uuid}`.
///
/// The generation tag and region allow the router to resolve the owning
/// store without a metadata lookup; the shard index is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParRequestUri {
    /// Deployment generation tag.
    pub generation: u32,
    /// Region label (e.g. `us`, `eu`).
    pub region: String,
    /// Shard index within the regional PAR store.
    pub shard: u32,
    /// Unique request UUID.
    pub uuid: Uuid,
}

impl ParRequestUri {
    /// Creates a new request URI with a random UUID.
    #[must_use]
    pub fn new(generation: u32, region: impl Into<String>, shard: u32) -> Self {
        Self {
            generation,
            region: region.into(),
            shard,
            uuid: Uuid::new_v4(),
        }
    }

    /// Parses a PAR request URI from its URN form.
    ///
    /// # Errors
    ///
    /// Returns an error if the URN prefix or any segment is malformed.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix(PAR_URI_PREFIX)
            .ok_or_else(|| IdError::malformed("missing request_uri URN prefix"))?;

        let segments: Vec<&str> = rest.split(':').collect();
        if segments.len() != 4 {
            return Err(IdError::malformed(format!(
                "expected 4 segments after prefix, got {}",
                segments.len()
            )));
        }

        let generation = segments[0]
            .strip_prefix('g')
            .and_then(|g| g.parse::<u32>().ok())
            .ok_or_else(|| IdError::malformed("invalid generation segment"))?;
        let region = segments[1];
        if region.is_empty() {
            return Err(IdError::malformed("empty region segment"));
        }
        let shard = segments[2]
            .parse::<u32>()
            .map_err(|_| IdError::invalid_shard_index(segments[2]))?;
        let uuid = segments[3]
            .strip_prefix("par_")
            .ok_or_else(|| IdError::malformed("missing par_ tag"))?;
        let uuid = Uuid::parse_str(uuid).map_err(|_| IdError::InvalidUuid)?;

        Ok(Self {
            generation,
            region: region.to_string(),
            shard,
            uuid,
        })
    }

    /// Returns `true` if the string carries the PAR URN prefix.
    #[must_use]
    pub fn is_par_uri(s: &str) -> bool {
        s.starts_with(PAR_URI_PREFIX)
    }
}

impl fmt::Display for ParRequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}g{}:{}:{}:par_{}",
            PAR_URI_PREFIX, self.generation, self.region, self.shard, self.uuid
        )
    }
}

impl FromStr for ParRequestUri {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new(3);
        let wire = id.to_string();
        assert!(wire.starts_with("3_session_"));

        let parsed = SessionId::parse(&wire).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_session_id_rejects_wrong_tag() {
        let result = SessionId::parse("3_auth_9f8a0c6e-1234-4abc-8def-aaaaaaaaaaaa");
        assert!(matches!(result.unwrap_err(), IdError::Malformed { .. }));
    }

    #[test]
    fn test_session_id_rejects_opaque_values() {
        assert!(!SessionId::is_sharded_format("legacy-opaque-cookie-value"));
        assert!(!SessionId::is_sharded_format(""));
        assert!(!SessionId::is_sharded_format("x_session_not-a-uuid"));
    }

    #[test]
    fn test_auth_code_roundtrip() {
        let code = AuthCode::generate(5);
        assert_eq!(code.random.len(), 43, "32 random bytes encode to 43 chars");

        let wire = code.to_string();
        let parsed = AuthCode::parse(&wire).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn test_auth_code_uniqueness() {
        let a = AuthCode::generate(0);
        let b = AuthCode::generate(0);
        assert_ne!(a.random, b.random);
    }

    #[test]
    fn test_auth_code_survives_shard_reload() {
        // A code minted under one shard count must remain parseable after the
        // count changes, because the shard index travels inside the code.
        let code = AuthCode::generate(7);
        let wire = code.to_string();
        let parsed = AuthCode::parse(&wire).unwrap();
        assert_eq!(parsed.shard, 7);
    }

    #[test]
    fn test_auth_code_rejects_empty_segment() {
        assert!(AuthCode::parse("3_auth_").is_err());
        assert!(AuthCode::parse("3_auth").is_err());
        assert!(AuthCode::parse("abc_auth_xyz").is_err());
    }

    #[test]
    fn test_par_uri_roundtrip() {
        let uri = ParRequestUri::new(1, "us", 3);
        let wire = uri.to_string();
        assert!(wire.starts_with("urn:ietf:params:oauth:request_uri:g1:us:3:par_"));

        let parsed = ParRequestUri::parse(&wire).unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn test_par_uri_detection() {
        assert!(ParRequestUri::is_par_uri(
            "urn:ietf:params:oauth:request_uri:g1:us:0:par_9f8a0c6e-1234-4abc-8def-aaaaaaaaaaaa"
        ));
        assert!(!ParRequestUri::is_par_uri("https://example.com/request"));
    }

    #[test]
    fn test_par_uri_rejects_malformed() {
        assert!(ParRequestUri::parse("urn:ietf:params:oauth:request_uri:g1:us:3").is_err());
        assert!(ParRequestUri::parse("urn:ietf:params:oauth:request_uri:1:us:3:par_x").is_err());
        assert!(
            ParRequestUri::parse("urn:ietf:params:oauth:request_uri:g1::3:par_x").is_err(),
            "empty region must be rejected"
        );
    }
}
