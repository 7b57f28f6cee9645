use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use nettest_runner::{parse_settings, DummyNettest, Runner, StderrSink};

/// nettest-runner drives a network measurement described by a settings JSON
/// document, emitting structured events on stderr as it progresses.
#[derive(Parser, Debug, Clone)]
#[clap(version, verbatim_doc_comment)]
struct Cli {
    /// Path to the settings JSON document.
    settings: PathBuf,
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-runtime")
        .enable_all()
        .build()?;
    rt.block_on(main_impl())?;
    // give the runtime some time to finish, but do not wait indefinitely
    rt.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}

async fn main_impl() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let raw = tokio::fs::read_to_string(&cli.settings)
        .await
        .with_context(|| format!("cannot read {}", cli.settings.display()))?;
    let (settings, warnings) = parse_settings(&raw)?;
    for warning in warnings {
        tracing::warn!("{warning}");
    }

    let runner = Arc::new(Runner::new(
        settings,
        Arc::new(DummyNettest),
        Box::new(StderrSink),
    ));
    let interrupter = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt requested, stopping between measurements");
            interrupter.interrupt();
        }
    });
    runner.run().await;
    Ok(())
}
