//! Console monitor following a pipeline run over the real-time channel.
//!
//! Run with: cargo run -p pulsewire-live-monitor
//!
//! Reads `PULSEWIRE_URL`, `PULSEWIRE_TOKEN` and the backoff variables from
//! the environment. Start `pulsewire-mock-server` first for local data.

use pulsewire_core::{ChannelConfig, ConnectionStatus, GitActivity, InfraMetric};
use pulsewire_runstate::{RunStateReconciler, RunTree};
use pulsewire_transport::RealtimeChannel;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ChannelConfig::from_env()?.with_client_name("live-monitor");
    tracing::info!(?config, "Starting monitor");

    let channel = RealtimeChannel::new(config)?;
    let reconciler = RunStateReconciler::new();
    let _attachment = reconciler.attach(channel.registry());

    let _metrics = channel.subscribe_typed::<InfraMetric, _>(|metric| {
        tracing::info!(
            host = %metric.host,
            metric = %metric.metric,
            value = metric.value,
            unit = metric.unit.as_deref().unwrap_or(""),
            "Infrastructure"
        );
    });
    let _git = channel.subscribe_typed::<GitActivity, _>(|activity| {
        tracing::info!(
            repository = %activity.repository,
            branch = activity.branch.as_deref().unwrap_or("-"),
            sha = activity.sha.as_deref().unwrap_or("-"),
            "Git activity"
        );
    });

    tokio::spawn(report_status(channel.watch_status()));
    tokio::spawn(report_run(reconciler.clone(), reconciler.changes()));

    channel.connect();
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    channel.disconnect();
    channel.shutdown().await;
    print_tree(&reconciler.snapshot());
    Ok(())
}

async fn report_status(mut status: watch::Receiver<ConnectionStatus>) {
    loop {
        {
            let current = status.borrow_and_update();
            match &current.last_error {
                Some(error) => tracing::info!(
                    state = %current.state,
                    attempt = current.attempt_count,
                    %error,
                    "{}",
                    current.label()
                ),
                None => tracing::info!(state = %current.state, "{}", current.label()),
            }
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}

async fn report_run(reconciler: RunStateReconciler, mut changes: watch::Receiver<u64>) {
    while changes.changed().await.is_ok() {
        let tree = reconciler.snapshot();
        let summary: Vec<String> = tree
            .stages
            .iter()
            .map(|stage| format!("{} {:?} {}%", stage.name, stage.status, stage.progress))
            .collect();
        tracing::info!(run = tree.run_id.as_deref().unwrap_or("-"), "{}", summary.join(" | "));
    }
}

fn print_tree(tree: &RunTree) {
    println!("Run {}", tree.run_id.as_deref().unwrap_or("-"));
    for stage in &tree.stages {
        println!("  {} {:?} {}%", stage.name, stage.status, stage.progress);
        for job in &stage.children {
            let duration = job.duration.map(|d| format!(" ({d}s)")).unwrap_or_default();
            println!("    {} {:?} {}%{duration}", job.name, job.status, job.progress);
            for step in &job.children {
                println!("      {} {:?}", step.name, step.status);
            }
        }
    }
}
