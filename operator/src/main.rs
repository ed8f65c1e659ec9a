use clap::Parser;
use kocao_common::args::{load_dotenv, ControlPlaneArgs};
use kocao_common::shutdown::shutdown_signal;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    kocao_common::init();

    let args = ControlPlaneArgs::parse();
    args.validate_http_addr()?;
    let namespace = args.resolved_namespace()?;

    let client = kube::Client::try_default().await?;
    println!(
        "{} {}",
        "kocao-operator starting, namespace scope:".green(),
        if namespace.is_empty() {
            "<cluster-wide>"
        } else {
            namespace.as_str()
        },
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    tokio::join!(
        kocao_core::session::run(client.clone(), shutdown.clone()),
        kocao_core::run::run(client, shutdown),
    );

    println!("{}", "kocao-operator shut down cleanly".yellow());
    Ok(())
}
