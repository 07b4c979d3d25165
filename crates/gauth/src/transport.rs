//! Abstract single-call HTTP contract and a `reqwest`-backed default
//! implementation (spec §4.3, component C3).
//!
//! Implementations MUST NOT retry; retry is [`crate::server::TokenServer`]'s
//! responsibility via [`crate::backoff::Backoff`]. HTTP status >= 400 is not
//! an error at this layer - it is surfaced through [`HttpResponse::status`]
//! and classified by [`crate::fetcher`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single outbound request. `body` is a raw octet sequence; callers are
/// responsible for any encoding (e.g. `application/x-www-form-urlencoded`).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn post_form(url: impl Into<String>, form_body: String) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        Self {
            method: Method::Post,
            url: url.into(),
            headers,
            body: form_body.into_bytes(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Pluggable single-call transport. One gateway instance is shared by every
/// mint attempt a [`crate::server::TokenServer`] makes; implementations may
/// hold a connection pool.
#[async_trait]
pub trait HttpGateway: Send + Sync + std::fmt::Debug {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Default gateway backed by `reqwest`. Redirects are disabled - a credential
/// fetch silently following a redirect to an attacker-controlled host would
/// leak the assertion or refresh token.
#[derive(Debug, Clone)]
pub struct ReqwestGateway {
    client: reqwest::Client,
}

impl ReqwestGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("failed to build default reqwest client"),
        }
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpGateway for ReqwestGateway {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, &request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::transport(request.url.clone(), e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(request.url.clone(), e))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reqwest_gateway_surfaces_non_200_without_erroring() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let gateway = ReqwestGateway::new();
        let response = gateway
            .call(HttpRequest::post_form(
                format!("{}/token", server.url()),
                "grant_type=x".to_string(),
            ))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body_str(), "boom");
    }

    #[tokio::test]
    async fn reqwest_gateway_round_trips_a_200() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/meta")
            .match_header("metadata-flavor", "Google")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let gateway = ReqwestGateway::new();
        let response = gateway
            .call(HttpRequest::get(format!("{}/meta", server.url())).with_header("Metadata-Flavor", "Google"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), "hello");
    }
}
