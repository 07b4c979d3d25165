//! Builds and RS256-signs JWT-bearer assertions (spec §4.2, component C2).
//!
//! Pure aside from reading the wall clock for `iat`/`exp`: no network calls,
//! no caching. [`crate::fetcher`] is the only caller, and is responsible for
//! resolving the final claim set (scope/target_audience/claim overrides)
//! before handing it to [`sign`].

use std::collections::HashMap;

use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::token::now_epoch;

/// Default lifetime of a self-signed assertion, per spec §4.2.
pub(crate) const ASSERTION_LIFETIME_SECONDS: i64 = 3600;

/// Fallback token endpoint used when a `ServiceAccount` source does not
/// specify `token_uri` and the caller did not override `aud`.
pub(crate) const DEFAULT_TOKEN_URI: &str = "https://www.googleapis.com/oauth2/v4/token";

/// Default OAuth scope used when neither `scope` nor `target_audience` is
/// present in the resolved claim set (spec §4.2/§4.4).
pub(crate) const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Build the baseline claim set for a service-account assertion:
/// `iss = client_email`, `aud`, `iat = now`, `exp = now + 3600`.
/// Caller-supplied overrides (`source.options.claims`) are merged on top by
/// the fetcher, not here - this function only knows the defaults.
#[must_use]
pub(crate) fn default_claims(client_email: &str, aud: &str) -> Map<String, Value> {
    let iat = now_epoch();
    let mut claims = Map::new();
    claims.insert("iss".into(), Value::String(client_email.to_string()));
    claims.insert("aud".into(), Value::String(aud.to_string()));
    claims.insert("iat".into(), Value::from(iat));
    claims.insert(
        "exp".into(),
        Value::from(iat + ASSERTION_LIFETIME_SECONDS),
    );
    claims
}

/// Merge string-valued overrides into a claim set. Keys recognized by the
/// rest of the pipeline are `sub`, `scope`, `target_audience`, `aud`; any
/// other key is carried through as a private claim (assertions are free to
/// carry extra claims - only the recognized ones change fetcher behavior).
pub(crate) fn apply_overrides(claims: &mut Map<String, Value>, overrides: &HashMap<String, String>) {
    for (k, v) in overrides {
        claims.insert(k.clone(), Value::String(v.clone()));
    }
}

/// RS256-sign `claims` over an `{alg: "RS256", typ: "JWT"}` header, producing
/// a compact JWS. Fails with [`Error::Crypto`] on malformed PEM.
pub(crate) fn sign(claims: &Map<String, Value>, private_key_pem: &[u8]) -> Result<String> {
    let key = EncodingKey::from_rsa_pem(private_key_pem)
        .map_err(|e| Error::Crypto(format!("invalid RSA private key PEM: {e}")))?;
    let header = Header::new(Algorithm::RS256);
    jsonwebtoken::encode(&header, claims, &key).map_err(|e| Error::Crypto(e.to_string()))
}

/// Decode the payload segment of a compact JWS *without* verifying its
/// signature. Used for the `id_token` and metadata-identity response shapes
/// (spec §4.4), where the token itself is the artifact handed back to the
/// caller and this crate is not the relying party that needs to trust it.
pub(crate) fn decode_unverified(jws: &str) -> Result<Map<String, Value>> {
    let mut parts = jws.split('.');
    let (_header, payload) = match (parts.next(), parts.next()) {
        (Some(h), Some(p)) => (h, p),
        _ => {
            return Err(Error::Decode {
                url: "<id_token>".into(),
                reason: "not a three-part compact JWS".into(),
            })
        }
    };
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Decode {
            url: "<id_token>".into(),
            reason: format!("payload is not valid base64url: {e}"),
        })?;
    serde_json::from_slice::<Value>(&raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .ok_or_else(|| Error::Decode {
            url: "<id_token>".into(),
            reason: "payload is not a JSON object".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit RSA test key, PKCS#1 PEM. Used only to exercise signing; not
    // a production secret.
    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_key.pem");

    #[test]
    fn default_claims_has_expected_shape() {
        let claims = default_claims("svc@project.iam.gserviceaccount.com", "https://aud.example");
        assert_eq!(
            claims["iss"],
            Value::String("svc@project.iam.gserviceaccount.com".into())
        );
        assert_eq!(claims["aud"], Value::String("https://aud.example".into()));
        let iat = claims["iat"].as_i64().unwrap();
        let exp = claims["exp"].as_i64().unwrap();
        assert_eq!(exp - iat, ASSERTION_LIFETIME_SECONDS);
    }

    #[test]
    fn overrides_replace_matching_keys_and_add_new_ones() {
        let mut claims = default_claims("svc@x", "aud");
        let mut overrides = HashMap::new();
        overrides.insert("sub".to_string(), "bob@x".to_string());
        overrides.insert("scope".to_string(), "s".to_string());
        apply_overrides(&mut claims, &overrides);

        assert_eq!(claims["sub"], Value::String("bob@x".into()));
        assert_eq!(claims["scope"], Value::String("s".into()));
        // defaults untouched
        assert_eq!(claims["iss"], Value::String("svc@x".into()));
    }

    #[test]
    fn sign_then_decode_unverified_recovers_claims() {
        let mut claims = default_claims("svc@x", "aud");
        let mut overrides = HashMap::new();
        overrides.insert("sub".to_string(), "bob@x".to_string());
        overrides.insert("scope".to_string(), "s".to_string());
        apply_overrides(&mut claims, &overrides);

        let jws = sign(&claims, TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let decoded = decode_unverified(&jws).unwrap();

        assert_eq!(decoded["iss"], Value::String("svc@x".into()));
        assert_eq!(decoded["sub"], Value::String("bob@x".into()));
        assert_eq!(decoded["scope"], Value::String("s".into()));
    }

    #[test]
    fn sign_rejects_malformed_pem() {
        let claims = default_claims("svc@x", "aud");
        let err = sign(&claims, b"not a pem").unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn decode_unverified_rejects_non_jws_strings() {
        let err = decode_unverified("not-a-jws").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
