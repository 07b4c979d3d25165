use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every credential source and server state
/// transition. Variants are retried or surfaced per the policy documented on
/// each one; see [`crate::server::TokenServer`] for where that policy lives.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// The HTTP round-trip to the token or metadata endpoint failed outright
    /// (connect error, TLS error, timeout at the transport level). Retried.
    #[error("transport error contacting {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    /// The endpoint replied with a non-200 status. Retried.
    #[error("unexpected status {status} from {url}: {}", summarize_body(body))]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },

    /// A 200 response whose body could not be parsed into the expected
    /// shape (neither a token response nor a raw/id-token JWS). Retried.
    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// PEM parsing or RS256 signing failed. Retried (a persistently bad key
    /// will exhaust retries and surface as `FatalRefreshError`).
    #[error("crypto error signing assertion: {0}")]
    Crypto(String),

    /// The `Source` given to `start()` is malformed: a required field is
    /// missing, or a claim key is not one of the recognized overrides.
    /// Retried like any other mint failure (see spec §7).
    #[error("invalid credential source: {0}")]
    Config(String),

    /// `fetch`'s rendezvous with the owning server did not complete within
    /// the caller-supplied timeout. The in-flight mint, if any, continues.
    #[error("fetch timed out after {0}ms waiting for a token")]
    Timeout(u64),

    /// `max_retries` was exhausted; the server has transitioned to
    /// `TERMINATED` and will not attempt further mints.
    #[error("refresh exhausted after {attempts} attempts, server terminated: {last_cause}")]
    FatalRefresh {
        attempts: u32,
        last_cause: Box<Error>,
    },

    /// The server named in `fetch(name, ..)` was never registered.
    #[error("no token server registered for this name")]
    NotFound,

    /// The owning server was shut down while a caller was rendezvousing.
    #[error("server was shut down while fetch() was waiting")]
    Cancelled,
}

impl Error {
    pub(crate) fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source: Arc::new(source),
        }
    }

    /// Whether this variant is retried by `TokenServer`'s mint loop.
    /// `FatalRefresh`, `Timeout`, `NotFound`, and `Cancelled` are terminal
    /// outcomes of a single `fetch` call, not raw mint failures, and are
    /// never themselves retried.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::UnexpectedStatus { .. } | Error::Decode { .. } | Error::Crypto(_) | Error::Config(_)
        )
    }
}

fn summarize_body(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct TokenErrorResponse {
        error: String,
        error_description: Option<String>,
    }

    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(e) => match e.error_description {
            Some(desc) => format!("{} ({desc})", e.error),
            None => e.error,
        },
        Err(_) => {
            if body.len() > 200 {
                format!("{}...", body.chars().take(200).collect::<String>())
            } else {
                body.to_string()
            }
        }
    }
}
