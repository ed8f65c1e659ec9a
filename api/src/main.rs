mod app;
mod args;
mod routes;

use std::sync::Arc;

use clap::Parser;
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use args::Args;
use kocao_common::args::load_dotenv;
use kocao_common::shutdown::shutdown_signal;
use kocao_core::attach::AttachService;
use kocao_core::audit::AuditStore;
use kocao_core::auth::TokenStore;

use app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    kocao_common::init();

    let args = Args::parse();
    args.validate_http_addr()?;
    let namespace = args.resolved_namespace()?;

    let client = kube::Client::try_default().await?;

    let tokens = Arc::new(TokenStore::new());
    tokens.ensure_bootstrap_token(&args.bootstrap_token);
    let audit = Arc::new(AuditStore::from_path(&args.audit_log_path));
    let attach = Arc::new(AttachService::new(namespace.clone(), client.clone(), tokens.clone(), audit.clone()));

    let state = App::new(client, namespace.clone(), tokens, audit, attach);

    let cors_origins = args.cors_origin_list();
    let cors = if cors_origins.is_empty() {
        kocao_common::cors::dev()
    } else {
        let origins: Vec<&str> = cors_origins.iter().map(String::as_str).collect();
        kocao_common::cors::prod(&origins)
    };

    let router = routes::router(state)
        .layer(axum::middleware::from_fn(kocao_common::access_log::request))
        .layer(cors);

    let addr = normalize_addr(&args.http_addr);
    let listener = TcpListener::bind(&addr).await?;
    println!("{} {}", "kocao-api listening on".green(), addr.green().dimmed());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    println!("{}", "kocao-api shut down cleanly".yellow());
    Ok(())
}

fn normalize_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(rest) => format!("0.0.0.0:{rest}"),
        None => addr.to_string(),
    }
}
