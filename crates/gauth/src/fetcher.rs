//! Source-aware, stateless minting of one token via one network round-trip
//! (spec §4.4, component C4). `fetch` performs exactly one attempt; it knows
//! nothing about caching, timers, or retry - [`crate::server::TokenServer`]
//! owns that.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::error::{Error, Result};
use crate::jwt;
use crate::source::{Credentials, SubjectTokenSource};
use crate::token::{now_epoch, Token};
use crate::transport::{HttpGateway, HttpRequest};

const STS_GRANT_TYPE: &str = "urn:ietf:params:oauth:token-exchange";
const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SUBJECT_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
const REQUESTED_TOKEN_TYPE_ACCESS: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Perform one mint attempt against `source.credentials` via `gateway`.
pub(crate) async fn fetch(
    credentials: &Credentials,
    options: &crate::source::Options,
    gateway: &dyn HttpGateway,
) -> Result<Token> {
    match credentials {
        Credentials::ServiceAccount {
            client_email,
            private_key_pem,
            token_uri,
        } => fetch_service_account(client_email, private_key_pem, token_uri.as_ref(), options, gateway).await,
        Credentials::RefreshToken {
            client_id,
            client_secret,
            refresh_token,
        } => fetch_refresh_token(client_id, client_secret, refresh_token, options, gateway).await,
        Credentials::Metadata {
            account,
            base_url,
            audience,
        } => {
            let audience = audience.as_deref().or(options.audience.as_deref());
            fetch_metadata(account, base_url, audience, gateway).await
        }
        Credentials::WorkloadIdentity {
            token_url,
            sa_impersonation_url,
            subject_token_source,
        } => {
            fetch_workload_identity(
                token_url,
                sa_impersonation_url.as_ref(),
                subject_token_source,
                options,
                gateway,
            )
            .await
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    sub: Option<String>,
    id_token: Option<String>,
}

/// Parse the OAuth token-endpoint response shape of spec §6.2: either an
/// `access_token` response, or (when `allow_id_token`) an `id_token` whose
/// payload we decode without verifying the signature (spec §4.4).
fn parse_token_response(
    url: &str,
    body: &[u8],
    effective_scope: Option<&str>,
    claim_sub: Option<&str>,
    allow_id_token: bool,
) -> Result<Token> {
    let parsed: AccessTokenResponse = serde_json::from_slice(body).map_err(|e| Error::Decode {
        url: url.to_string(),
        reason: format!("response body is not the expected JSON shape: {e}"),
    })?;

    if let Some(access_token) = parsed.access_token {
        let expires_in = parsed.expires_in.unwrap_or(0);
        return Ok(Token {
            token: access_token,
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: parsed.scope.or_else(|| effective_scope.map(str::to_string)),
            sub: parsed.sub.or_else(|| claim_sub.map(str::to_string)),
            expires: now_epoch() + expires_in,
        });
    }

    if allow_id_token {
        if let Some(id_token) = parsed.id_token {
            let payload = jwt::decode_unverified(&id_token)?;
            let exp = payload
                .get("exp")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::Decode {
                    url: url.to_string(),
                    reason: "id_token payload is missing `exp`".to_string(),
                })?;
            return Ok(Token {
                token: id_token,
                token_type: "Bearer".to_string(),
                scope: payload.get("aud").and_then(Value::as_str).map(str::to_string),
                sub: payload.get("sub").and_then(Value::as_str).map(str::to_string),
                expires: exp,
            });
        }
    }

    Err(Error::Decode {
        url: url.to_string(),
        reason: "response has neither `access_token` nor `id_token`".to_string(),
    })
}

async fn call_and_classify(gateway: &dyn HttpGateway, request: HttpRequest) -> Result<Vec<u8>> {
    let url = request.url.clone();
    let response = gateway.call(request).await?;
    if response.status != 200 {
        return Err(Error::UnexpectedStatus {
            url,
            status: response.status,
            body: response.body_str().to_string(),
        });
    }
    Ok(response.body)
}

fn form_encode(params: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

async fn fetch_service_account(
    client_email: &str,
    private_key_pem: &str,
    token_uri: Option<&Url>,
    options: &crate::source::Options,
    gateway: &dyn HttpGateway,
) -> Result<Token> {
    let aud = token_uri
        .map(Url::to_string)
        .unwrap_or_else(|| jwt::DEFAULT_TOKEN_URI.to_string());
    let mut claims = jwt::default_claims(client_email, &aud);
    jwt::apply_overrides(&mut claims, &options.claims);

    let has_scope_or_audience = claims.contains_key("scope") || claims.contains_key("target_audience");
    let effective_scope = if has_scope_or_audience {
        claims.get("scope").and_then(Value::as_str).map(str::to_string)
    } else {
        let scope = if options.scopes.is_empty() {
            jwt::DEFAULT_SCOPE.to_string()
        } else {
            options.scopes.join(" ")
        };
        claims.insert("scope".to_string(), Value::String(scope.clone()));
        Some(scope)
    };
    let claim_sub = claims.get("sub").and_then(Value::as_str).map(str::to_string);

    let assertion = jwt::sign(&claims, private_key_pem.as_bytes())?;
    let target = options
        .url
        .as_ref()
        .map(Url::to_string)
        .or_else(|| token_uri.map(Url::to_string))
        .unwrap_or_else(|| jwt::DEFAULT_TOKEN_URI.to_string());

    let body = form_encode(&[
        ("grant_type", JWT_BEARER_GRANT_TYPE),
        ("assertion", assertion.as_str()),
    ]);
    let raw = call_and_classify(gateway, HttpRequest::post_form(target.clone(), body)).await?;
    parse_token_response(&target, &raw, effective_scope.as_deref(), claim_sub.as_deref(), true)
}

async fn fetch_refresh_token(
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
    options: &crate::source::Options,
    gateway: &dyn HttpGateway,
) -> Result<Token> {
    let target = options
        .url
        .as_ref()
        .map(Url::to_string)
        .unwrap_or_else(|| jwt::DEFAULT_TOKEN_URI.to_string());

    let body = form_encode(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ]);
    let raw = call_and_classify(gateway, HttpRequest::post_form(target.clone(), body)).await?;
    parse_token_response(&target, &raw, None, None, false)
}

async fn fetch_metadata(
    account: &str,
    base_url: &Url,
    audience: Option<&str>,
    gateway: &dyn HttpGateway,
) -> Result<Token> {
    let base = base_url.as_str().trim_end_matches('/');

    if let Some(audience) = audience {
        let url = format!(
            "{base}/computeMetadata/v1/instance/service-accounts/{account}/identity?audience={}",
            url::form_urlencoded::byte_serialize(audience.as_bytes()).collect::<String>()
        );
        let request = HttpRequest::get(url.clone()).with_header("Metadata-Flavor", "Google");
        let raw = call_and_classify(gateway, request).await?;
        let jws = String::from_utf8(raw).map_err(|e| Error::Decode {
            url: url.clone(),
            reason: format!("identity response body is not valid UTF-8: {e}"),
        })?;
        let payload = jwt::decode_unverified(&jws)?;
        let exp = payload
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Decode {
                url,
                reason: "identity token payload is missing `exp`".to_string(),
            })?;
        return Ok(Token {
            token: jws,
            token_type: "Bearer".to_string(),
            scope: payload.get("aud").and_then(Value::as_str).map(str::to_string),
            sub: payload.get("sub").and_then(Value::as_str).map(str::to_string),
            expires: exp,
        });
    }

    let url = format!("{base}/computeMetadata/v1/instance/service-accounts/{account}/token");
    let request = HttpRequest::get(url.clone()).with_header("Metadata-Flavor", "Google");
    let raw = call_and_classify(gateway, request).await?;
    parse_token_response(&url, &raw, None, None, false)
}

#[derive(Debug, Deserialize)]
struct StsResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImpersonationResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: String,
}

async fn load_subject_token(source: &SubjectTokenSource) -> Result<String> {
    match source {
        SubjectTokenSource::File(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
                .await
                .map_err(|e| Error::Config(format!("subject token file task panicked: {e}")))?
                .map_err(|e| Error::Config(format!("failed to read subject token file: {e}")))
                .map(|s| s.trim().to_string())
        }
        SubjectTokenSource::Url { url, headers } => {
            let gateway = crate::transport::ReqwestGateway::new();
            let mut request = HttpRequest::get(url.to_string());
            for (k, v) in headers {
                request = request.with_header(k.clone(), v.clone());
            }
            let raw = call_and_classify(&gateway, request).await?;
            String::from_utf8(raw)
                .map(|s| s.trim().to_string())
                .map_err(|e| Error::Decode {
                    url: url.to_string(),
                    reason: format!("subject token response is not valid UTF-8: {e}"),
                })
        }
        SubjectTokenSource::Executable { command, args } => {
            let command = command.clone();
            let args = args.clone();
            tokio::task::spawn_blocking(move || std::process::Command::new(&command).args(&args).output())
                .await
                .map_err(|e| Error::Config(format!("subject token executable task panicked: {e}")))?
                .map_err(|e| Error::Config(format!("failed to run subject token executable: {e}")))
                .and_then(|output| {
                    if !output.status.success() {
                        return Err(Error::Config(format!(
                            "subject token executable exited with {}",
                            output.status
                        )));
                    }
                    String::from_utf8(output.stdout)
                        .map(|s| s.trim().to_string())
                        .map_err(|e| Error::Config(format!("subject token executable output is not valid UTF-8: {e}")))
                })
        }
    }
}

async fn fetch_workload_identity(
    token_url: &Url,
    sa_impersonation_url: Option<&Url>,
    subject_token_source: &SubjectTokenSource,
    options: &crate::source::Options,
    gateway: &dyn HttpGateway,
) -> Result<Token> {
    let subject_token = load_subject_token(subject_token_source).await?;

    let scope = if options.scopes.is_empty() {
        jwt::DEFAULT_SCOPE.to_string()
    } else {
        options.scopes.join(" ")
    };

    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", STS_GRANT_TYPE.to_string());
    params.insert("requested_token_type", REQUESTED_TOKEN_TYPE_ACCESS.to_string());
    params.insert("subject_token", subject_token);
    params.insert("subject_token_type", SUBJECT_TOKEN_TYPE_JWT.to_string());
    params.insert("scope", scope);

    let form_pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let body = form_encode(&form_pairs);
    let raw = call_and_classify(
        gateway,
        HttpRequest::post_form(token_url.to_string(), body),
    )
    .await?;
    let sts: StsResponse = serde_json::from_slice(&raw).map_err(|e| Error::Decode {
        url: token_url.to_string(),
        reason: format!("STS response is not the expected JSON shape: {e}"),
    })?;

    let Some(impersonation_url) = sa_impersonation_url else {
        return Ok(Token {
            token: sts.access_token,
            token_type: sts.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: sts.scope,
            sub: None,
            expires: now_epoch() + sts.expires_in.unwrap_or(3600),
        });
    };

    let request = HttpRequest::post_form(impersonation_url.to_string(), String::new())
        .with_header("Authorization", format!("Bearer {}", sts.access_token))
        .with_header("Content-Type", "application/json; charset=utf-8");
    let raw = call_and_classify(gateway, request).await?;
    let impersonated: ImpersonationResponse = serde_json::from_slice(&raw).map_err(|e| Error::Decode {
        url: impersonation_url.to_string(),
        reason: format!("impersonation response is not the expected JSON shape: {e}"),
    })?;
    let expires = OffsetDateTime::parse(&impersonated.expire_time, &Rfc3339)
        .map_err(|e| Error::Decode {
            url: impersonation_url.to_string(),
            reason: format!("expireTime is not RFC3339: {e}"),
        })?
        .unix_timestamp();

    Ok(Token {
        token: impersonated.access_token,
        token_type: "Bearer".to_string(),
        scope: sts.scope,
        sub: None,
        expires,
    })
}
