//! Per-name state machine: prefetch, cache, schedule, retry, serve (spec
//! §4.6, component C6). This is the component callers actually hold on to.
//!
//! Each named server is one `tokio::spawn`ed task running its own sequential
//! loop; callers rendezvous with it over an mpsc mailbox. The
//! [`crate::registry::Registry`] is the only state shared across threads
//! without going through that mailbox, and only the owning task ever writes
//! into its slot.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backoff::{Backoff, BackoffKind};
use crate::error::{Error, Result};
use crate::fetcher;
use crate::registry::Registry;
use crate::source::Source;
use crate::token::{now_epoch, Token};
use crate::transport::HttpGateway;

const DEFAULT_REFRESH_BEFORE_SECONDS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 20;

/// Whether `start` waits for the first mint (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prefetch {
    #[default]
    Async,
    Sync,
}

/// Options accepted by [`TokenServer::start`].
#[derive(Debug, Clone)]
pub struct StartOptions<Name> {
    pub name: Name,
    pub source: Source,
    pub http: Arc<dyn HttpGateway>,
    pub refresh_before_seconds: u64,
    pub max_retries: u32,
    pub backoff_kind: BackoffKind,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub prefetch: Prefetch,
}

impl<Name> StartOptions<Name> {
    #[must_use]
    pub fn new(name: Name, source: Source, http: Arc<dyn HttpGateway>) -> Self {
        Self {
            name,
            source,
            http,
            refresh_before_seconds: DEFAULT_REFRESH_BEFORE_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_kind: BackoffKind::default(),
            backoff_min_ms: Backoff::DEFAULT_MIN_MS,
            backoff_max_ms: Backoff::DEFAULT_MAX_MS,
            prefetch: Prefetch::default(),
        }
    }

    #[must_use]
    pub fn refresh_before_seconds(mut self, seconds: u64) -> Self {
        self.refresh_before_seconds = seconds;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn backoff(mut self, kind: BackoffKind, min_ms: u64, max_ms: u64) -> Self {
        self.backoff_kind = kind;
        self.backoff_min_ms = min_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    #[must_use]
    pub fn prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch = prefetch;
        self
    }
}

enum Command {
    Fetch { reply: oneshot::Sender<Result<Token>> },
}

struct ActorHandle {
    mailbox: mpsc::Sender<Command>,
}

/// Supervisor owning one actor task per registered name, plus the shared
/// registry those tasks publish into (spec §9's "pair: supervisor of
/// TokenServer instances, each an isolated unit").
pub struct TokenServer<Name: Eq + Hash + Clone + Debug + Send + Sync + 'static> {
    registry: Registry<Name>,
    actors: RwLock<HashMap<Name, ActorHandle>>,
}

impl<Name: Eq + Hash + Clone + Debug + Send + Sync + 'static> TokenServer<Name> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            actors: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry<Name> {
        &self.registry
    }

    /// Start a new named server. If `opts.prefetch` is `Sync`, suspends the
    /// caller until the first mint attempt (success or failure) completes.
    pub async fn start(&self, opts: StartOptions<Name>) -> Result<()> {
        let name = opts.name.clone();
        let prefetch = opts.prefetch;
        self.registry.register(name.clone());

        let (mailbox_tx, mailbox_rx) = mpsc::channel(64);
        let (prefetch_tx, prefetch_rx) = oneshot::channel();

        let registry = self.registry.clone();
        tokio::spawn(run_actor(opts, registry, mailbox_rx, Some(prefetch_tx)));

        self.actors
            .write()
            .expect("server registry lock poisoned")
            .insert(name, ActorHandle { mailbox: mailbox_tx });

        if matches!(prefetch, Prefetch::Async) {
            return Ok(());
        }
        match prefetch_rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Ok(()), // actor task ended before reporting; treat as started
        }
    }

    /// The hot path (spec §4.6): a fresh cached token answers without
    /// suspending; otherwise this rendezvous with the owning actor.
    pub async fn fetch(&self, name: &Name, timeout_ms: u64) -> Result<Token> {
        if let Some(token) = self.registry.snapshot(name) {
            return Ok(token);
        }

        let mailbox = {
            let actors = self.actors.read().expect("server registry lock poisoned");
            actors.get(name).map(|h| h.mailbox.clone())
        };
        let Some(mailbox) = mailbox else {
            return Err(Error::NotFound);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if mailbox.send(Command::Fetch { reply: reply_tx }).await.is_err() {
            return Err(Error::Cancelled);
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout(timeout_ms)),
        }
    }

    /// Same rendezvous as [`TokenServer::fetch`]; kept as a distinct entry
    /// point per spec §6.1 for callers that want the name to read as
    /// "propagate, don't swallow".
    pub async fn fetch_or_error(&self, name: &Name, timeout_ms: u64) -> Result<Token> {
        self.fetch(name, timeout_ms).await
    }

    /// Drop the actor handle for `name`. The actor's mailbox closes, its task
    /// exits on the next loop iteration, and any rendezvous already waiting
    /// on it resolves to `Cancelled` (spec §5's shutdown behavior).
    pub fn shutdown(&self, name: &Name) {
        self.actors.write().expect("server registry lock poisoned").remove(name);
    }
}

impl<Name: Eq + Hash + Clone + Debug + Send + Sync + 'static> Default for TokenServer<Name> {
    fn default() -> Self {
        Self::new()
    }
}

/// One mint attempt loop: retries every retryable error with backoff up to
/// `max_retries`, then raises `FatalRefresh` (spec §4.6's retry policy).
async fn mint_with_retry(
    source: &Source,
    http: &dyn HttpGateway,
    max_retries: u32,
    backoff: &mut Backoff,
) -> Result<Token> {
    backoff.reset();
    let mut attempts: u32 = 0;
    loop {
        match fetcher::fetch(&source.credentials, &source.options, http).await {
            Ok(token) => return Ok(token),
            Err(e) if e.is_retryable() => {
                attempts += 1;
                if attempts > max_retries {
                    return Err(Error::FatalRefresh {
                        attempts,
                        last_cause: Box::new(e),
                    });
                }
                tracing::warn!(attempts, max_retries, error = %e, "mint attempt failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff.next())).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_actor<Name: Eq + Hash + Clone + Debug + Send + Sync + 'static>(
    opts: StartOptions<Name>,
    registry: Registry<Name>,
    mut mailbox: mpsc::Receiver<Command>,
    mut prefetch_reply: Option<oneshot::Sender<Result<Token>>>,
) {
    let StartOptions {
        name,
        source,
        http,
        refresh_before_seconds,
        max_retries,
        backoff_kind,
        backoff_min_ms,
        backoff_max_ms,
        prefetch,
    } = opts;

    let span = tracing::span!(tracing::Level::TRACE, "token_server", name = ?name);
    let _enter = span.enter();

    let mut backoff = Backoff::new(backoff_kind, backoff_min_ms, backoff_max_ms)
        .unwrap_or_else(|_| Backoff::default());

    let first_mint = mint_with_retry(&source, http.as_ref(), max_retries, &mut backoff).await;
    let mut terminated_error: Option<Error> = None;
    let mut next_refresh_at: Option<Instant> = None;

    match &first_mint {
        Ok(token) => {
            tracing::debug!("prefetch succeeded, expires in {}s", token.seconds_until_expiry(now_epoch()));
            registry.publish(&name, token.clone());
            next_refresh_at = Some(schedule_delay(token, refresh_before_seconds));
        }
        Err(e @ Error::FatalRefresh { .. }) => {
            tracing::error!(error = %e, "prefetch exhausted retries, server terminated");
            terminated_error = Some(e.clone());
        }
        Err(e) => {
            tracing::warn!(error = %e, "prefetch failed non-retryably");
            terminated_error = Some(e.clone());
        }
    }

    if let Some(tx) = prefetch_reply.take() {
        if matches!(prefetch, Prefetch::Sync) {
            let _ = tx.send(first_mint.clone());
        }
        // Async prefetch: caller already returned from `start`; drop the
        // sender without sending so its receiver future resolves to Err,
        // which `start` treats as success either way.
    }

    loop {
        let sleep_target = next_refresh_at;
        let sleep = async move {
            match sleep_target {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = mailbox.recv() => {
                let Some(Command::Fetch { reply }) = command else {
                    tracing::debug!("mailbox closed, server task exiting");
                    return;
                };

                if let Some(err) = &terminated_error {
                    let _ = reply.send(Err(err.clone()));
                    continue;
                }
                if let Some(token) = registry.snapshot(&name) {
                    let _ = reply.send(Ok(token));
                    continue;
                }

                let result = mint_with_retry(&source, http.as_ref(), max_retries, &mut backoff).await;
                match &result {
                    Ok(token) => {
                        registry.publish(&name, token.clone());
                        next_refresh_at = Some(schedule_delay(token, refresh_before_seconds));
                    }
                    Err(e @ Error::FatalRefresh { .. }) => {
                        tracing::error!(error = %e, "refresh exhausted retries, server terminated");
                        terminated_error = Some(e.clone());
                        next_refresh_at = None;
                    }
                    Err(_) => {
                        // Non-fatal, non-retryable mint error: surface to this
                        // caller, leave the server ready to try again on the
                        // next call rather than terminating it.
                    }
                }
                let _ = reply.send(result);
            }
            () = sleep, if next_refresh_at.is_some() => {
                tracing::trace!("scheduled refresh firing");
                let result = mint_with_retry(&source, http.as_ref(), max_retries, &mut backoff).await;
                match result {
                    Ok(token) => {
                        next_refresh_at = Some(schedule_delay(&token, refresh_before_seconds));
                        registry.publish(&name, token);
                    }
                    Err(e @ Error::FatalRefresh { .. }) => {
                        tracing::error!(error = %e, "scheduled refresh exhausted retries, server terminated");
                        terminated_error = Some(e);
                        next_refresh_at = None;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "scheduled refresh failed, will retry on next fetch");
                        next_refresh_at = None;
                    }
                }
            }
        }
    }
}

fn schedule_delay(token: &Token, refresh_before_seconds: u64) -> Instant {
    let delay = (token.expires - now_epoch() - refresh_before_seconds as i64).max(0);
    Instant::now() + Duration::from_secs(delay as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tracing_test::{logs_contain, traced_test};

    use super::*;
    use crate::source::Credentials;
    use crate::transport::{HttpRequest, HttpResponse};

    #[derive(Debug)]
    struct CountingGateway {
        calls: AtomicUsize,
        statuses: std::sync::Mutex<Vec<u16>>,
    }

    impl CountingGateway {
        fn new(statuses: Vec<u16>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                statuses: std::sync::Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl HttpGateway for CountingGateway {
        async fn call(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 { statuses.remove(0) } else { *statuses.first().unwrap() };
            let body = if status == 200 {
                serde_json::json!({"access_token": "dummy", "expires_in": 3599, "token_type": "Bearer"})
                    .to_string()
            } else {
                "boom".to_string()
            };
            Ok(HttpResponse {
                status,
                headers: HashMap::new(),
                body: body.into_bytes(),
            })
        }
    }

    fn refresh_source() -> Source {
        Source::new(Credentials::RefreshToken {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "rt".into(),
        })
    }

    #[tokio::test]
    async fn cache_hit_serves_without_a_second_mint() {
        let gateway = Arc::new(CountingGateway::new(vec![200]));
        let server: TokenServer<&str> = TokenServer::new();
        let opts = StartOptions::new("a", refresh_source(), gateway.clone())
            .prefetch(Prefetch::Sync);
        server.start(opts).await.unwrap();

        let t1 = server.fetch(&"a", 1000).await.unwrap();
        let t2 = server.fetch(&"a", 1000).await.unwrap();
        assert_eq!(t1.token, t2.token);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn retry_then_succeed_mints_after_two_failures() {
        let gateway = Arc::new(CountingGateway::new(vec![500, 500, 200]));
        let server: TokenServer<&str> = TokenServer::new();
        let opts = StartOptions::new("a", refresh_source(), gateway.clone())
            .max_retries(5)
            .backoff(BackoffKind::Exp, 1, 10)
            .prefetch(Prefetch::Sync);
        server.start(opts).await.unwrap();

        let token = server.fetch(&"a", 5000).await.unwrap();
        assert_eq!(token.token, "dummy");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(logs_contain("retrying"));
    }

    #[tokio::test]
    #[traced_test]
    async fn retry_exhaustion_becomes_fatal_and_terminates() {
        let gateway = Arc::new(CountingGateway::new(vec![500]));
        let server: TokenServer<&str> = TokenServer::new();
        let opts = StartOptions::new("a", refresh_source(), gateway.clone())
            .max_retries(3)
            .backoff(BackoffKind::Exp, 1, 5)
            .prefetch(Prefetch::Sync);
        let start_result = server.start(opts).await;
        assert!(matches!(start_result, Err(Error::FatalRefresh { .. })));

        let err = server.fetch(&"a", 5000).await.unwrap_err();
        assert!(matches!(err, Error::FatalRefresh { .. }));

        // Server stays terminated: subsequent fetches replay the fatal error
        // without minting again.
        let calls_after_first = gateway.calls.load(Ordering::SeqCst);
        let err2 = server.fetch(&"a", 5000).await.unwrap_err();
        assert!(matches!(err2, Error::FatalRefresh { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), calls_after_first);
        assert!(logs_contain("server terminated"));
    }

    #[tokio::test]
    async fn forced_refresh_on_expired_cache_mints_a_new_token() {
        let gateway = Arc::new(CountingGateway::new(vec![200]));
        let server: TokenServer<&str> = TokenServer::new();
        let opts = StartOptions::new("a", refresh_source(), gateway.clone())
            .prefetch(Prefetch::Sync);
        server.start(opts).await.unwrap();

        server.registry().publish(
            &"a",
            Token {
                token: "stale".into(),
                token_type: "Bearer".into(),
                scope: None,
                sub: None,
                expires: now_epoch() - 1,
            },
        );

        let token = server.fetch(&"a", 5000).await.unwrap();
        assert_eq!(token.token, "dummy");
    }

    #[tokio::test]
    async fn fetch_against_unknown_name_is_not_found() {
        let server: TokenServer<&str> = TokenServer::new();
        let err = server.fetch(&"missing", 100).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
