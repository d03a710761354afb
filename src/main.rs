use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airwave::{
    broadcast::{BroadcastPlanner, LoggingPlaybackExecutor, PlaybackExecutor},
    config::Config,
    job_scheduling::{Dispatcher, JobArchive, JobQueue},
    models::{JobPayload, NewJob, SubmitterProfile},
    observability::AppObservability,
    services::{
        CircuitBreakerManager, InMemoryProfileStore, ResilientInvoker, SimulatedProvider,
        TracingAlertSink,
    },
};

#[derive(Parser)]
#[command(name = "airwave")]
#[command(version)]
#[command(about = "Priority queue and broadcast scheduler for generated audio requests")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "airwave.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue, dispatcher and planner against a simulated provider
    RunDemo {
        /// Number of submissions to generate
        #[arg(long, default_value_t = 12)]
        jobs: usize,

        /// Probability that a simulated provider call fails with 503
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,

        /// How long to run before shutting down (Ctrl-C stops earlier)
        #[arg(long, default_value = "20s")]
        duration: humantime::Duration,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("airwave={}", cli.log_level);
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| log_filter.into()),
    );
    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting airwave v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_file(&cli.config)?;

    match cli.command.unwrap_or(Command::PrintConfig) {
        Command::PrintConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::RunDemo {
            jobs,
            failure_rate,
            duration,
        } => run_demo(config, jobs, failure_rate, duration.into()).await,
    }
}

async fn run_demo(config: Config, jobs: usize, failure_rate: f64, duration: Duration) -> Result<()> {
    let observability = AppObservability::new("airwave")?;

    let profiles = Arc::new(InMemoryProfileStore::new());
    profiles
        .upsert("alice", SubmitterProfile::new(240.0, 12, true))
        .await;
    profiles
        .upsert("bob", SubmitterProfile::new(60.0, 2, false))
        .await;
    profiles
        .upsert("mallory", SubmitterProfile::new(500.0, 40, true))
        .await;

    let breakers = CircuitBreakerManager::new(config.invoker.circuit_breaker.clone());
    let provider = SimulatedProvider::new(config.invoker.endpoint.clone())
        .with_failure_rate(failure_rate)
        .with_latency(Duration::from_millis(200), Duration::from_millis(1500));
    let invoker = Arc::new(
        ResilientInvoker::from_config(&config.invoker, Arc::new(provider), &breakers)
            .await?
            .with_observability(observability.clone()),
    );

    let queue = Arc::new(
        JobQueue::new(
            profiles.clone(),
            config.queue.clone(),
            invoker.bulkhead().capacity(),
        )
        .with_observability(observability.clone()),
    );
    let archive = Arc::new(JobArchive::new(config.dispatcher.archive_capacity));
    let planner = Arc::new(
        BroadcastPlanner::new(config.broadcast.clone(), archive.clone())
            .with_observability(observability.clone()),
    );
    let dispatcher = Dispatcher::new(
        queue.clone(),
        invoker.clone(),
        planner.clone(),
        Arc::new(TracingAlertSink),
        archive.clone(),
        config.dispatcher.clone(),
    )
    .with_observability(observability.clone());

    let cancellation_token = CancellationToken::new();
    let (profile_updates, profile_updates_rx) = mpsc::channel(16);

    let dispatcher_handle = {
        let dispatcher = dispatcher.clone();
        let token = cancellation_token.clone();
        tokio::spawn(async move { dispatcher.run(token).await })
    };
    let planner_handle = {
        let planner = planner.clone();
        let token = cancellation_token.clone();
        let executor: Arc<dyn PlaybackExecutor> = Arc::new(LoggingPlaybackExecutor);
        tokio::spawn(async move { planner.run(executor, token).await })
    };
    let listener_handle = {
        let queue = queue.clone();
        let token = cancellation_token.clone();
        tokio::spawn(async move { queue.run_rescore_listener(profile_updates_rx, token).await })
    };

    let submitters = ["alice", "bob", "carol", "mallory"];
    let categories = ["lofi", "synthwave", "jazz", "ambient"];
    for i in 0..jobs {
        let submitter = submitters[i % submitters.len()];
        let category = categories[(i / 2) % categories.len()];
        let request = NewJob::new(
            submitter,
            JobPayload::new(serde_json::json!({ "prompt": format!("{category} track #{i}") })),
            category,
        );
        match queue.submit(request).await {
            Ok(receipt) => info!(
                "Submitted job {} for {} at position {} (score {:.1}, wait ~{})",
                receipt.job_id,
                submitter,
                receipt.position,
                receipt.priority_score,
                humantime::format_duration(receipt.estimated_wait)
            ),
            Err(e) => warn!("Submission for {} rejected: {}", submitter, e),
        }
    }

    // Community feedback arrives while jobs wait: bob gets upvoted, mallory gets banned
    profiles
        .upsert("bob", SubmitterProfile::new(60.0, 30, true))
        .await;
    profiles.upsert("mallory", SubmitterProfile::banned()).await;
    for submitter in ["bob", "mallory"] {
        if profile_updates.send(submitter.to_string()).await.is_err() {
            warn!("Profile update listener is gone");
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        _ = tokio::time::sleep(duration) => info!("Demo duration elapsed, shutting down"),
    }

    cancellation_token.cancel();
    dispatcher_handle.await??;
    planner_handle.await??;
    listener_handle.await?;

    let stats = dispatcher.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for (endpoint, breaker) in breakers.get_all_stats().await {
        println!(
            "breaker {}: {} (trips: {}, rejected: {}, failure rate: {:.2})",
            endpoint,
            breaker.state,
            breaker.trips,
            breaker.rejected_calls,
            breaker.failure_rate()
        );
    }
    for slot in planner.timeline().await {
        println!(
            "{}  {:<10} {}",
            slot.start.format("%H:%M:%S"),
            slot.category().unwrap_or("-"),
            humantime::format_duration(slot.expected_duration)
        );
    }
    println!("{} ready jobs not yet scheduled", planner.ready_count().await);

    Ok(())
}
