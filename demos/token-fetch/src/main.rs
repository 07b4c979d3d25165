use std::sync::Arc;

use gauth::server::{Prefetch, StartOptions, TokenServer};
use gauth::source::Source;
use gauth::transport::{HttpGateway, ReqwestGateway};

/// Mints a token for the ambient credentials and prints its scope and
/// remaining lifetime. Falls back to the GCE metadata server if no
/// `GOOGLE_APPLICATION_CREDENTIALS*` environment variable is set.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let source = gauth::credentials::discover().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "no ambient credentials found, falling back to the metadata server");
        Source::new(gauth::source::Credentials::metadata_default())
    });

    let server: TokenServer<&str> = TokenServer::new();
    let gateway: Arc<dyn HttpGateway> = Arc::new(ReqwestGateway::new());
    let opts = StartOptions::new("default", source, gateway).prefetch(Prefetch::Sync);

    if let Err(e) = server.start(opts).await {
        eprintln!("failed to mint an initial token: {e}");
        std::process::exit(1);
    }

    match server.fetch(&"default", 5000).await {
        Ok(token) => println!(
            "minted a token: type={} scope={:?} expires_in={}s",
            token.token_type,
            token.scope,
            token.seconds_until_expiry(now_epoch())
        ),
        Err(e) => eprintln!("fetch failed: {e}"),
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}
