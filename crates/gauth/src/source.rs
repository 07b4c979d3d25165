//! Credential and source data model (spec §3).
//!
//! `Source` is captured once when a [`crate::server::TokenServer`] starts
//! and is treated as immutable for its lifetime - there is no API to mutate
//! a running server's source.

use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

/// One of the four credential flows this crate mints tokens for.
///
/// `Debug` is hand-implemented below (rather than `#[derive(veil::Redact)]`,
/// which only supports structs) to keep secrets out of logs.
#[derive(Clone)]
pub enum Credentials {
    ServiceAccount {
        client_email: String,
        private_key_pem: String,
        token_uri: Option<Url>,
    },
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    Metadata {
        account: String,
        base_url: Url,
        audience: Option<String>,
    },
    WorkloadIdentity {
        token_url: Url,
        sa_impersonation_url: Option<Url>,
        subject_token_source: SubjectTokenSource,
    },
}

impl Credentials {
    #[must_use]
    pub fn metadata_default() -> Self {
        Self::Metadata {
            account: "default".to_string(),
            base_url: Url::parse("http://metadata.google.internal").expect("static url"),
            audience: None,
        }
    }
}

/// Where a workload-identity subject token comes from before it is
/// exchanged at the STS endpoint. Supplemented detail for spec §4.4's
/// "file, URL, or executable" (see SPEC_FULL §11).
#[derive(Debug, Clone)]
pub enum SubjectTokenSource {
    File(PathBuf),
    Url {
        url: Url,
        headers: HashMap<String, String>,
    },
    Executable {
        command: String,
        args: Vec<String>,
    },
}

/// Per-source tuning: endpoint override, requested scopes, claim overrides,
/// and (for identity-token flows) the target audience.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub url: Option<Url>,
    pub scopes: Vec<String>,
    /// Overrides merged into the default JWT claim set. Recognized keys are
    /// `sub`, `scope`, `target_audience`, `aud`; values must be strings
    /// (spec §4.4, `ConfigError` on non-string claim values is enforced by
    /// the caller constructing this map, since it is typed `String` here).
    pub claims: HashMap<String, String>,
    pub audience: Option<String>,
}

impl Options {
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

/// A credential plus the options that parameterize minting from it.
#[derive(Debug, Clone)]
pub struct Source {
    pub credentials: Credentials,
    pub options: Options,
    /// Informational only (SPEC_FULL §11) - a project-id hint surfaced for
    /// logging, never used to route requests.
    pub project_id: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ServiceAccount { client_email, .. } => f
                .debug_struct("ServiceAccount")
                .field("client_email", client_email)
                .field("private_key_pem", &"<redacted>")
                .finish(),
            Credentials::RefreshToken { client_id, .. } => f
                .debug_struct("RefreshToken")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .field("refresh_token", &"<redacted>")
                .finish(),
            Credentials::Metadata {
                account,
                base_url,
                audience,
            } => f
                .debug_struct("Metadata")
                .field("account", account)
                .field("base_url", base_url)
                .field("audience", audience)
                .finish(),
            Credentials::WorkloadIdentity {
                token_url,
                sa_impersonation_url,
                subject_token_source,
            } => f
                .debug_struct("WorkloadIdentity")
                .field("token_url", token_url)
                .field("sa_impersonation_url", sa_impersonation_url)
                .field("subject_token_source", subject_token_source)
                .finish(),
        }
    }
}

impl Source {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            options: Options::default(),
            project_id: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_default_uses_default_account_and_host() {
        let Credentials::Metadata {
            account, base_url, ..
        } = Credentials::metadata_default()
        else {
            panic!("expected Metadata variant");
        };
        assert_eq!(account, "default");
        assert_eq!(base_url.as_str(), "http://metadata.google.internal/");
    }

    #[test]
    fn options_builder_accumulates_scopes_and_claims() {
        let opts = Options::default()
            .with_scope("a")
            .with_scope("b")
            .with_claim("sub", "bob@x");
        assert_eq!(opts.scopes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(opts.claims.get("sub").unwrap(), "bob@x");
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials::RefreshToken {
            client_id: "id".into(),
            client_secret: "super-secret".into(),
            refresh_token: "rt".into(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("rt"));
    }
}
