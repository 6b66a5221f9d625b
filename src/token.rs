//! Clone token verification
//!
//! A clone token is an RS256-signed JWT minted by the CDI API server. It
//! asserts that its bearer may clone one specific source claim into one
//! specific target claim, for a bounded time.

use std::collections::BTreeMap;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::annotations::ObjectKey;

/// Issuer the API server signs clone tokens as
pub const CLONE_TOKEN_ISSUER: &str = "cdi-apiserver";

/// Clock skew tolerated on the token's validity window
pub const CLONE_TOKEN_LEEWAY: Duration = Duration::from_secs(10);

const PVC_RESOURCE: &str = "persistentvolumeclaims";
const PARAM_TARGET_NAMESPACE: &str = "targetNamespace";
const PARAM_TARGET_NAME: &str = "targetName";

/// Why a token was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("clone token missing")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature verification failed")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token issuer mismatch")]
    WrongIssuer,

    #[error("invalid token: {0}")]
    SubjectMismatch(String),
}

impl TokenError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Missing => "missing",
            TokenError::Malformed(_) => "malformed",
            TokenError::BadSignature => "bad_signature",
            TokenError::Expired => "expired",
            TokenError::WrongIssuer => "wrong_issuer",
            TokenError::SubjectMismatch(_) => "subject_mismatch",
        }
    }
}

/// Operation a token authorizes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Clone,
    #[serde(other)]
    Unknown,
}

/// Group/version/resource of the token's subject
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
}

impl GroupVersionResource {
    pub fn persistent_volume_claims() -> Self {
        Self {
            group: String::new(),
            version: "v1".into(),
            resource: PVC_RESOURCE.into(),
        }
    }
}

/// Application claims of a clone token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub operation: Operation,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resource: GroupVersionResource,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl TokenPayload {
    /// Payload authorizing a clone from `source` into `target`
    pub fn clone_of(source: &ObjectKey, target: &ObjectKey) -> Self {
        Self {
            operation: Operation::Clone,
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            resource: GroupVersionResource::persistent_volume_claims(),
            params: BTreeMap::from([
                (PARAM_TARGET_NAMESPACE.to_string(), target.namespace.clone()),
                (PARAM_TARGET_NAME.to_string(), target.name.clone()),
            ]),
        }
    }
}

/// Full claim set: registered JWT claims plus the payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub payload: TokenPayload,
}

/// Stateless verifier for clone tokens
pub struct CloneTokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl CloneTokenValidator {
    pub fn new(issuer: &str, key: DecodingKey, leeway: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.leeway = leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        Self { key, validation }
    }

    /// Validator for tokens minted by the CDI API server
    pub fn for_clone(key: DecodingKey) -> Self {
        Self::new(CLONE_TOKEN_ISSUER, key, CLONE_TOKEN_LEEWAY)
    }

    /// Verify `token` and check that it authorizes `operation` from
    /// `source` into `target`.
    pub fn validate(
        &self,
        token: &str,
        source: &ObjectKey,
        target: &ObjectKey,
        operation: Operation,
    ) -> Result<TokenPayload, TokenError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::BadSignature
                }
                ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        let payload = data.claims.payload;
        check_subject(&payload, source, target, operation)?;
        Ok(payload)
    }
}

fn check_subject(
    payload: &TokenPayload,
    source: &ObjectKey,
    target: &ObjectKey,
    operation: Operation,
) -> Result<(), TokenError> {
    if payload.operation != operation {
        return Err(TokenError::SubjectMismatch(format!(
            "operation {:?} does not match {:?}",
            payload.operation, operation
        )));
    }
    if payload.resource.resource != PVC_RESOURCE {
        return Err(TokenError::SubjectMismatch(format!(
            "resource {:?} is not a persistentvolumeclaim",
            payload.resource.resource
        )));
    }
    if payload.namespace != source.namespace || payload.name != source.name {
        return Err(TokenError::SubjectMismatch(format!(
            "source {}/{} does not match {}",
            payload.namespace, payload.name, source
        )));
    }
    let param = |key: &str| payload.params.get(key).map(String::as_str).unwrap_or_default();
    if param(PARAM_TARGET_NAMESPACE) != target.namespace || param(PARAM_TARGET_NAME) != target.name {
        return Err(TokenError::SubjectMismatch(format!(
            "target {}/{} does not match {}",
            param(PARAM_TARGET_NAMESPACE),
            param(PARAM_TARGET_NAME),
            target
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/apiserver.key");
    const VERIFY_KEY: &[u8] = include_bytes!("../tests/fixtures/apiserver.pub");
    const ROGUE_KEY: &[u8] = include_bytes!("../tests/fixtures/rogue.key");

    fn validator() -> CloneTokenValidator {
        CloneTokenValidator::for_clone(DecodingKey::from_rsa_pem(VERIFY_KEY).unwrap())
    }

    fn source() -> ObjectKey {
        ObjectKey::new("ns2", "source")
    }

    fn target() -> ObjectKey {
        ObjectKey::new("ns", "target")
    }

    fn sign_with(key: &[u8], claims: &TokenClaims) -> String {
        encode(
            &Header::new(Algorithm::RS256),
            claims,
            &EncodingKey::from_rsa_pem(key).unwrap(),
        )
        .unwrap()
    }

    fn claims(expires_in_secs: i64) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            iss: CLONE_TOKEN_ISSUER.into(),
            exp: now + expires_in_secs,
            nbf: Some(now - 60),
            iat: Some(now - 60),
            payload: TokenPayload::clone_of(&source(), &target()),
        }
    }

    #[test]
    fn accepts_matching_unexpired_token() {
        let token = sign_with(SIGNING_KEY, &claims(300));
        let payload = validator()
            .validate(&token, &source(), &target(), Operation::Clone)
            .unwrap();
        assert_eq!(payload.name, "source");
        assert_eq!(payload.params[PARAM_TARGET_NAME], "target");
    }

    #[test]
    fn leeway_absorbs_small_clock_skew() {
        let token = sign_with(SIGNING_KEY, &claims(-5));
        assert!(validator()
            .validate(&token, &source(), &target(), Operation::Clone)
            .is_ok());
    }

    #[test]
    fn rejects_token_expired_beyond_leeway() {
        let token = sign_with(SIGNING_KEY, &claims(-60));
        assert_eq!(
            validator().validate(&token, &source(), &target(), Operation::Clone),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn rejects_foreign_signature() {
        let token = sign_with(ROGUE_KEY, &claims(300));
        assert_eq!(
            validator().validate(&token, &source(), &target(), Operation::Clone),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn rejects_wrong_issuer() {
        let mut c = claims(300);
        c.iss = "someone-else".into();
        let token = sign_with(SIGNING_KEY, &c);
        assert_eq!(
            validator().validate(&token, &source(), &target(), Operation::Clone),
            Err(TokenError::WrongIssuer)
        );
    }

    #[test]
    fn rejects_mismatched_pair() {
        let token = sign_with(SIGNING_KEY, &claims(300));
        let other_target = ObjectKey::new("ns", "elsewhere");
        let err = validator()
            .validate(&token, &source(), &other_target, Operation::Clone)
            .unwrap_err();
        assert!(matches!(err, TokenError::SubjectMismatch(_)));

        let other_source = ObjectKey::new("ns3", "source");
        let err = validator()
            .validate(&token, &other_source, &target(), Operation::Clone)
            .unwrap_err();
        assert!(matches!(err, TokenError::SubjectMismatch(_)));
    }

    #[test]
    fn rejects_other_operations() {
        let mut c = claims(300);
        c.payload.operation = Operation::Unknown;
        let token = sign_with(SIGNING_KEY, &c);
        let err = validator()
            .validate(&token, &source(), &target(), Operation::Clone)
            .unwrap_err();
        assert!(matches!(err, TokenError::SubjectMismatch(_)));
    }

    #[test]
    fn rejects_garbage() {
        let err = validator()
            .validate("not-a-jwt", &source(), &target(), Operation::Clone)
            .unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let json = serde_json::to_value(TokenPayload::clone_of(&source(), &target())).unwrap();
        assert_eq!(json["operation"], "Clone");
        assert_eq!(json["resource"]["resource"], "persistentvolumeclaims");
        assert_eq!(json["params"]["targetNamespace"], "ns");
    }
}
