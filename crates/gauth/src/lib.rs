#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

//! [![Crates.io](https://img.shields.io/crates/v/gauth)](https://crates.io/crates/gauth)
//! [![License](https://img.shields.io/badge/License-Apache_2.0-blue.svg)](https://opensource.org/licenses/Apache-2.0)
//!
//! # Google Cloud token lifecycle engine
//!
//! `gauth` mints and caches OAuth2 access tokens for Google Cloud APIs. It is
//! deliberately *not* a request-signing client: it hands callers a fresh
//! [`Token`] and gets out of the way.
//!
//! * Four credential sources: service account (JWT-bearer), authorized-user
//!   refresh token, GCE instance metadata, and workload identity federation
//!   with optional service-account impersonation.
//! * A background-refreshed, per-name cache ([`server::TokenServer`]) that
//!   proactively renews before expiry and serializes concurrent mints.
//! * Bounded retry with jittered backoff ([`backoff::Backoff`]).
//! * Safe defaults - no redirects, secrets redacted from `Debug`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gauth::server::{StartOptions, TokenServer};
//! use gauth::source::{Credentials, Source};
//! use gauth::transport::ReqwestGateway;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = Source::new(Credentials::metadata_default());
//!     let server: TokenServer<&str> = TokenServer::new();
//!     server
//!         .start(StartOptions::new("default", source, Arc::new(ReqwestGateway::new())))
//!         .await
//!         .unwrap();
//!
//!     let token = server.fetch(&"default", 5000).await.unwrap();
//!     let _header = format!("Bearer {}", token.token);
//! }
//! ```

mod backoff;
pub mod credentials;
pub mod error;
mod fetcher;
mod jwt;
mod registry;
pub mod server;
pub mod source;
mod token;
pub mod transport;

pub use backoff::{Backoff, BackoffKind};
pub use error::{Error, Result};
pub use registry::Registry;
pub use token::Token;
