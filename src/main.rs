use anyhow::{anyhow, Error};
use async_trait::async_trait;
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    signal::unix::{signal, SignalKind},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use scanq::db::DbHandle;
use scanq::executor::{ScanExecutor, ScanReport, TimeoutExecutor, Violation};
use scanq::notify::{BatchSummary, Notifier};
use scanq::retry::RetryPolicy;
use scanq::store::{MemoryStore, ScanStore};
use scanq::{telemetry, JobRequest, QueueConfig, ScanQueue};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Scan a batch of URLs through the job queue")]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "connect_url",
        env = "DATABASE_URL",
        help = "PostgreSQL Connection URL, scans are kept in memory when absent"
    )]
    connect_url: Option<String>,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "SCANQ_WORKERS",
        help = "Number of Active Jobs in Parallel",
        default_value = "3"
    )]
    num: usize,

    #[arg(long = "max_retries", help = "Retries before a scan fails", default_value = "3")]
    max_retries: u32,

    #[arg(
        long = "retry_base_delay_ms",
        help = "Delay before the first retry, doubled on each further retry",
        default_value = "0"
    )]
    retry_base_delay_ms: u64,

    #[arg(long = "scan_timeout_secs", help = "Time limit of a single scan", default_value = "30")]
    scan_timeout_secs: u64,

    #[arg(long = "max_batch_size", help = "Maximum URLs in one batch", default_value = "100")]
    max_batch_size: usize,

    #[arg(long = "jaeger_endpoint", env = "JAEGER_ENDPOINT", help = "Jaeger collector endpoint")]
    jaeger_endpoint: Option<String>,

    #[arg(short = 'u', long = "user", help = "Owner of the submitted batch", default_value = "cli")]
    user: String,

    #[arg(help = "URLs to scan as one batch")]
    urls: Vec<String>,
}

/// Stand-in scan engine: every fourth call fails, findings depend on the URL.
#[derive(Default)]
struct SimulatedExecutor {
    calls: AtomicU64,
}

#[async_trait]
impl ScanExecutor for SimulatedExecutor {
    async fn perform_scan(&self, url: &str) -> Result<ScanReport, Error> {
        sleep(Duration::from_millis(100)).await;
        if self.calls.fetch_add(1, Ordering::SeqCst) % 4 == 3 {
            return Err(anyhow!("simulated scan failure for {}", url));
        }

        let violations = (0..url.len() % 5)
            .map(|i| Violation {
                id: format!("rule-{}", i),
                impact: Some("moderate".into()),
                description: format!("Simulated violation {} on {}", i, url),
                help: "Fix the markup".into(),
                help_url: "https://dequeuniversity.com/rules/axe".into(),
                nodes: vec![],
            })
            .collect();
        Ok(ScanReport { violations })
    }
}

struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, summary: &BatchSummary) -> Result<(), Error> {
        info!(event = "Notification", recipient, summary = %summary.render());
        Ok(())
    }
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let urls: Vec<String> = if config.urls.is_empty() {
        (0..10)
            .map(|i| format!("https://example.com/page/{}", i))
            .collect()
    } else {
        config.urls.clone()
    };

    let (store, batch, scans) = match &config.connect_url {
        Some(connect_url) => {
            let handle = DbHandle::new(connect_url).await?;
            let (batch, scans) = handle.create_batch(&config.user, &urls).await?;
            (Arc::new(handle) as Arc<dyn ScanStore>, batch, scans)
        }
        None => {
            let store = MemoryStore::new();
            let (batch, scans) = store.create_batch(&config.user, &urls)?;
            (Arc::new(store) as Arc<dyn ScanStore>, batch, scans)
        }
    };

    let executor = TimeoutExecutor::new(
        SimulatedExecutor::default(),
        Duration::from_secs(config.scan_timeout_secs),
    );
    let queue = ScanQueue::new(
        QueueConfig {
            workers: config.num,
            max_batch_size: config.max_batch_size,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
        },
        store.clone(),
        Arc::new(executor),
        Arc::new(LogNotifier),
    );

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        tokio::spawn(
            async move {
                if let Err(err) = queue.serve(cancel_token).await {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    queue.enqueue_bulk(scans.iter().map(JobRequest::for_scan).collect())?;
    debug!("Done submitting batch {}", batch.id);

    tokio::select! {
        _ = cancel_token.cancelled() => {
            debug!("Server Cancelled");
        },
        _ = queue.wait_idle() => {
            if let Some(batch) = store.get_batch(batch.id).await? {
                info!(
                    event = "BatchFinished",
                    batch_id = %batch.id,
                    status = ?batch.status,
                    completed = batch.completed_urls,
                    failed = batch.failed_urls
                );
            }
            cancel_token.cancel();
        }
    }

    println!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
