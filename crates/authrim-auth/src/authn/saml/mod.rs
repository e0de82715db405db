//! SAML 2.0 service-provider assertion consumption.
//!
//! The ACS consumes a base64-encoded `SAMLResponse`, validates it, and
//! feeds the asserted identity into the same session pipeline as every
//! other authenticator.
//!
//! Validation order: DTD rejection, structural parse, `Destination`,
//! `Status`, issuer resolution, signature (with signature-wrapping
//! defenses), bearer subject confirmation, conditions with bounded clock
//! skew, audience restriction, one-time-use replay, attribute mapping and
//! JIT provisioning.
//!
//! Signature verification implements the exclusive-canonicalization subset
//! IdPs emit in practice: the digest input is the signed element's raw
//! bytes with the enveloped `Signature` subtree spliced out, and the signed
//! bytes of `SignedInfo` are taken verbatim. The structural wrapping
//! defenses (unique IDs, the reference must resolve to the element that
//! carries the signature) hold independently of canonicalization.

pub mod xml;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use rsa::Pkcs1v15Sign;
use rsa::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use authrim_config::AuthrimConfig;
use authrim_core::time::{DEFAULT_CLOCK_SKEW_SECS, now_unix};

use crate::AuthResult;
use crate::authn::{LoginCompletion, LoginCoordinator};
use crate::error::AuthError;
use crate::storage::{
    IdentityProvider, IdentityProviderStore, LinkedIdentity, LinkedIdentityStore, NewUser,
    SamlReplayStore, UserStore,
};
use xml::Element;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const SIGNATURE_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// The SAML SP authenticator.
pub struct SamlService {
    config: Arc<AuthrimConfig>,
    idps: Arc<dyn IdentityProviderStore>,
    replay: Arc<dyn SamlReplayStore>,
    users: Arc<dyn UserStore>,
    linked: Arc<dyn LinkedIdentityStore>,
    coordinator: Arc<LoginCoordinator>,
}

impl SamlService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        idps: Arc<dyn IdentityProviderStore>,
        replay: Arc<dyn SamlReplayStore>,
        users: Arc<dyn UserStore>,
        linked: Arc<dyn LinkedIdentityStore>,
        coordinator: Arc<LoginCoordinator>,
    ) -> Self {
        Self {
            config,
            idps,
            replay,
            users,
            linked,
            coordinator,
        }
    }

    /// The assertion consumer service URL.
    #[must_use]
    pub fn acs_url(&self) -> String {
        format!("{}/saml/sp/acs", self.config.issuer)
    }

    /// The SP entity id, used for audience restriction checks.
    #[must_use]
    pub fn sp_entity_id(&self) -> &str {
        &self.config.issuer
    }

    /// Records an outbound AuthnRequest id for `InResponseTo` validation.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the replay store fails.
    pub async fn register_authn_request(&self, request_id: &str) -> AuthResult<()> {
        self.replay
            .store_request_id(request_id, self.config.ttl.challenge.as_secs() as i64)
            .await
            .map_err(|_| AuthError::internal("replay store failed"))
    }

    /// Consumes a base64-encoded `SAMLResponse` from the ACS.
    ///
    /// # Errors
    ///
    /// Every validation failure surfaces as a generic `invalid_request`
    /// without detail that would aid probing.
    pub async fn consume_response(
        &self,
        saml_response_b64: &str,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        let decoded = BASE64_STD
            .decode(saml_response_b64.trim())
            .map_err(|_| AuthError::invalid_request("SAML response validation failed"))?;
        let xml_text = String::from_utf8(decoded)
            .map_err(|_| AuthError::invalid_request("SAML response validation failed"))?;

        match self.validate(&xml_text).await {
            Ok(identity) => {
                let user_id = self.provision(&identity).await?;
                self.coordinator
                    .establish(
                        &user_id,
                        vec!["saml".to_string()],
                        None,
                        serde_json::Value::Object(serde_json::Map::new()),
                        login_challenge,
                    )
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejected SAML response");
                // One generic error for the wire, whatever the cause.
                Err(AuthError::invalid_request("SAML response validation failed"))
            }
        }
    }

    async fn validate(&self, xml_text: &str) -> AuthResult<AssertedIdentity> {
        let response = xml::parse_document(xml_text)?;
        if response.name != "Response" {
            return Err(AuthError::invalid_request("not a samlp:Response"));
        }

        // Destination must be this ACS.
        let destination = response
            .attr("Destination")
            .ok_or_else(|| AuthError::invalid_request("missing Destination"))?;
        if destination != self.acs_url() {
            return Err(AuthError::invalid_request("Destination mismatch"));
        }

        // Status must be Success.
        let status_value = response
            .child("Status")
            .and_then(|s| s.child("StatusCode"))
            .and_then(|c| c.attr("Value"))
            .ok_or_else(|| AuthError::invalid_request("missing StatusCode"))?;
        if status_value != STATUS_SUCCESS {
            return Err(AuthError::invalid_request("non-success Status"));
        }

        // Exactly one assertion.
        let assertions = response.children_named("Assertion");
        let [assertion] = assertions.as_slice() else {
            return Err(AuthError::invalid_request("expected exactly one Assertion"));
        };
        let assertion: &Element = assertion;

        // Issuer resolves to a provisioned IdP.
        let issuer = assertion
            .child("Issuer")
            .map(Element::trimmed_text)
            .ok_or_else(|| AuthError::invalid_request("missing Issuer"))?;
        let idp = self
            .idps
            .find_by_entity_id(issuer)
            .await
            .map_err(|_| AuthError::internal("IdP lookup failed"))?
            .ok_or_else(|| AuthError::invalid_request("unknown Issuer"))?;

        // Signature wrapping defense: every ID in the document is unique.
        let mut ids = response.collect_ids();
        ids.sort();
        let unique_before = ids.len();
        ids.dedup();
        if ids.len() != unique_before {
            return Err(AuthError::invalid_request("duplicate IDs in document"));
        }

        // Signature, when present, must verify against the IdP key.
        if let Some(signature) = assertion.child("Signature") {
            self.verify_signature(xml_text, assertion, signature, &idp)?;
        } else {
            tracing::warn!("accepting unsigned SAML assertion");
        }

        // Bearer subject confirmation.
        let subject = assertion
            .child("Subject")
            .ok_or_else(|| AuthError::invalid_request("missing Subject"))?;
        let confirmation = subject
            .children_named("SubjectConfirmation")
            .into_iter()
            .find(|c| c.attr("Method") == Some(CONFIRMATION_BEARER))
            .ok_or_else(|| AuthError::invalid_request("no bearer SubjectConfirmation"))?;
        let data = confirmation
            .child("SubjectConfirmationData")
            .ok_or_else(|| AuthError::invalid_request("missing SubjectConfirmationData"))?;
        if data.attr("Recipient") != Some(self.acs_url().as_str()) {
            return Err(AuthError::invalid_request("Recipient mismatch"));
        }
        let not_on_or_after = data
            .attr("NotOnOrAfter")
            .ok_or_else(|| AuthError::invalid_request("missing NotOnOrAfter"))?;
        if parse_instant(not_on_or_after)? + DEFAULT_CLOCK_SKEW_SECS <= now_unix() {
            return Err(AuthError::invalid_request("SubjectConfirmationData expired"));
        }
        match data.attr("InResponseTo") {
            Some(in_response_to) => {
                let outstanding = self
                    .replay
                    .consume_request_id(in_response_to)
                    .await
                    .map_err(|_| AuthError::internal("replay store failed"))?;
                if !outstanding {
                    if idp.strict_in_response_to {
                        return Err(AuthError::invalid_request("InResponseTo unknown"));
                    }
                    tracing::warn!("InResponseTo did not match an outstanding request");
                }
            }
            None if idp.strict_in_response_to => {
                return Err(AuthError::invalid_request("missing InResponseTo"));
            }
            None => {}
        }

        // Conditions with bounded clock skew.
        let conditions = assertion
            .child("Conditions")
            .ok_or_else(|| AuthError::invalid_request("missing Conditions"))?;
        if let Some(not_before) = conditions.attr("NotBefore")
            && parse_instant(not_before)? - DEFAULT_CLOCK_SKEW_SECS > now_unix()
        {
            return Err(AuthError::invalid_request("assertion not yet valid"));
        }
        if let Some(not_on_or_after) = conditions.attr("NotOnOrAfter")
            && parse_instant(not_on_or_after)? + DEFAULT_CLOCK_SKEW_SECS <= now_unix()
        {
            return Err(AuthError::invalid_request("assertion expired"));
        }

        // Audience restriction must name this SP.
        let audiences: Vec<&str> = conditions
            .descendants("Audience")
            .into_iter()
            .map(Element::trimmed_text)
            .collect();
        if audiences.is_empty() || !audiences.contains(&self.sp_entity_id()) {
            return Err(AuthError::invalid_request("audience restriction failed"));
        }

        // OneTimeUse: record the assertion id to block replay.
        let assertion_id = assertion
            .attr("ID")
            .ok_or_else(|| AuthError::invalid_request("assertion has no ID"))?;
        if conditions.child("OneTimeUse").is_some() {
            let ttl = conditions
                .attr("NotOnOrAfter")
                .and_then(|v| parse_instant(v).ok())
                .map_or(600, |exp| (exp - now_unix()).max(60));
            let first_use = self
                .replay
                .mark_assertion_used(assertion_id, ttl)
                .await
                .map_err(|_| AuthError::internal("replay store failed"))?;
            if !first_use {
                return Err(AuthError::invalid_request("assertion replayed"));
            }
        }

        // Identity extraction.
        let name_id = subject
            .child("NameID")
            .map(Element::trimmed_text)
            .ok_or_else(|| AuthError::invalid_request("missing NameID"))?;
        let attributes = extract_attributes(assertion);
        let email = attributes
            .iter()
            .find(|(name, _)| name == &idp.email_attribute)
            .map(|(_, value)| value.clone());
        let display_name = attributes
            .iter()
            .find(|(name, _)| name == &idp.name_attribute)
            .map(|(_, value)| value.clone());

        Ok(AssertedIdentity {
            idp_entity_id: idp.entity_id,
            name_id: name_id.to_string(),
            email,
            display_name,
        })
    }

    fn verify_signature(
        &self,
        xml_text: &str,
        assertion: &Element,
        signature: &Element,
        idp: &IdentityProvider,
    ) -> AuthResult<()> {
        let signed_info = signature
            .child("SignedInfo")
            .ok_or_else(|| AuthError::invalid_request("missing SignedInfo"))?;
        let signature_method = signed_info
            .child("SignatureMethod")
            .and_then(|m| m.attr("Algorithm"))
            .ok_or_else(|| AuthError::invalid_request("missing SignatureMethod"))?;
        if signature_method != SIGNATURE_RSA_SHA256 {
            return Err(AuthError::invalid_request("unsupported SignatureMethod"));
        }

        let reference = signed_info
            .child("Reference")
            .ok_or_else(|| AuthError::invalid_request("missing Reference"))?;
        // The reference must point at the element carrying the signature;
        // a detached reference to some other subtree is exactly the
        // wrapping shape this defends against.
        let uri = reference
            .attr("URI")
            .ok_or_else(|| AuthError::invalid_request("missing Reference URI"))?;
        let assertion_id = assertion.attr("ID").unwrap_or_default();
        if uri.strip_prefix('#') != Some(assertion_id) {
            return Err(AuthError::invalid_request(
                "Reference does not target the signed assertion",
            ));
        }
        let digest_method = reference
            .child("DigestMethod")
            .and_then(|m| m.attr("Algorithm"))
            .ok_or_else(|| AuthError::invalid_request("missing DigestMethod"))?;
        if digest_method != DIGEST_SHA256 {
            return Err(AuthError::invalid_request("unsupported DigestMethod"));
        }
        let digest_value = reference
            .child("DigestValue")
            .map(Element::trimmed_text)
            .ok_or_else(|| AuthError::invalid_request("missing DigestValue"))?;

        // Digest input: the assertion bytes with the enveloped signature
        // subtree spliced out.
        let mut digest_input = String::new();
        digest_input.push_str(&xml_text[assertion.start..signature.start]);
        digest_input.push_str(&xml_text[signature.end..assertion.end]);
        let computed = BASE64_STD.encode(Sha256::digest(digest_input.as_bytes()));
        if computed != digest_value.replace(['\n', '\r', ' '], "") {
            return Err(AuthError::invalid_request("digest mismatch"));
        }

        // Signature over the SignedInfo bytes.
        let signature_value = signature
            .child("SignatureValue")
            .map(Element::trimmed_text)
            .ok_or_else(|| AuthError::invalid_request("missing SignatureValue"))?;
        let signature_bytes = BASE64_STD
            .decode(signature_value.replace(['\n', '\r', ' '], ""))
            .map_err(|_| AuthError::invalid_request("SignatureValue is not base64"))?;
        let signed_info_bytes = &xml_text[signed_info.start..signed_info.end];

        let public_key = rsa::RsaPublicKey::from_public_key_pem(&idp.verification_key_pem)
            .map_err(|_| AuthError::internal("IdP verification key is invalid"))?;
        public_key
            .verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(signed_info_bytes.as_bytes()),
                &signature_bytes,
            )
            .map_err(|_| AuthError::invalid_request("signature verification failed"))
    }

    async fn provision(&self, identity: &AssertedIdentity) -> AuthResult<String> {
        // A previously linked NameID maps straight to its user.
        if let Some(link) = self
            .linked
            .find(&identity.idp_entity_id, &identity.name_id)
            .await
            .map_err(|_| AuthError::internal("identity lookup failed"))?
        {
            return Ok(link.user_id);
        }

        // JIT provisioning: reuse an existing account by email, else create.
        let user_id = match &identity.email {
            Some(email) => match self
                .users
                .find_id_by_email(email)
                .await
                .map_err(|_| AuthError::internal("user lookup failed"))?
            {
                Some(id) => id,
                None => self
                    .users
                    .create(NewUser {
                        tenant_id: "default".to_string(),
                        user_type: "human".to_string(),
                        email: Some(email.clone()),
                        name: identity.display_name.clone(),
                        email_verified: true,
                    })
                    .await
                    .map_err(|_| AuthError::internal("user provisioning failed"))?,
            },
            None => self
                .users
                .create(NewUser {
                    tenant_id: "default".to_string(),
                    user_type: "human".to_string(),
                    email: None,
                    name: identity.display_name.clone(),
                    email_verified: false,
                })
                .await
                .map_err(|_| AuthError::internal("user provisioning failed"))?,
        };

        if let Err(e) = self
            .linked
            .create(LinkedIdentity {
                user_id: user_id.clone(),
                provider: identity.idp_entity_id.clone(),
                subject: identity.name_id.clone(),
                created_at: now_unix(),
            })
            .await
        {
            tracing::warn!(error = %e, "failed to record identity link");
        }
        Ok(user_id)
    }
}

struct AssertedIdentity {
    idp_entity_id: String,
    name_id: String,
    email: Option<String>,
    display_name: Option<String>,
}

fn extract_attributes(assertion: &Element) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    if let Some(statement) = assertion.child("AttributeStatement") {
        for attribute in statement.children_named("Attribute") {
            if let (Some(name), Some(value)) = (
                attribute.attr("Name"),
                attribute.child("AttributeValue").map(Element::trimmed_text),
            ) {
                attributes.push((name.to_string(), value.to_string()));
            }
        }
    }
    attributes
}

fn parse_instant(value: &str) -> AuthResult<i64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|t| t.unix_timestamp())
        .map_err(|_| AuthError::invalid_request("unparseable SAML instant"))
}
