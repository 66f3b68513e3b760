use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};

use lead_agent::config::AppConfig;
use lead_agent::context::AppContext;
use lead_agent::error::QueueError;
use lead_agent::logging;
use lead_agent::pipeline::LeadContext;
use lead_agent::worker::{join_background, spawn_result_sweeper, JobQueue, JobStatus, WorkerPool};

/// How often the REPL polls a job it is watching.
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LEAD_AGENT_LLM_API_KEY=sk-...");
        std::process::exit(1);
    });

    let _log_guard = logging::init(&config.logging)?;

    eprintln!("🤝 Lead Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({:?})", config.llm.model, config.llm.backend);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Workers: {} (lease {}s, job timeout {}s, max attempts {})",
        config.queue.workers,
        config.queue.lease.as_secs(),
        config.queue.job_timeout.as_secs(),
        config.queue.max_attempts
    );
    match &config.webhook {
        Some(webhook) => eprintln!("   Webhook: {}", webhook.url),
        None => eprintln!("   Webhook: disabled"),
    }
    eprintln!("   Type `lead_id|message` (or just a message) and press Enter. /quit to exit.\n");

    let ctx = AppContext::build(config).await?;

    let pool = WorkerPool::spawn(ctx.worker(), ctx.config.pool_config());
    let sweeper = spawn_result_sweeper(
        Arc::clone(&ctx.queue),
        ctx.config.queue.result_ttl,
        pool.subscribe(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut watchers = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    eprint!("> ");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            eprint!("> ");
                            continue;
                        }
                        if line == "/quit" {
                            break;
                        }
                        let (context, message) = parse_line(line);
                        match ctx.queue.enqueue(&message, context).await {
                            Ok(job_id) => {
                                eprintln!("queued {job_id}");
                                watchers.push(tokio::spawn(watch_job(Arc::clone(&ctx.queue), job_id)));
                            }
                            Err(e) => eprintln!("Error: {e}"),
                        }
                        eprint!("> ");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Error reading stdin");
                        break;
                    }
                }
            }
            _ = &mut ctrl_c => {
                eprintln!("\nShutting down...");
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        for watcher in &watchers {
            watcher.abort();
        }
    } else {
        join_all(watchers).await;
    }

    pool.shutdown().await;
    join_background("result sweeper", sweeper).await;
    Ok(())
}

/// Split `lead_id|message`. A line without a separator is a bare message.
fn parse_line(line: &str) -> (LeadContext, String) {
    match line.split_once('|') {
        Some((lead_id, message)) if !lead_id.trim().is_empty() => {
            (LeadContext::new(lead_id.trim()), message.trim().to_string())
        }
        Some((_, message)) => (LeadContext::default(), message.trim().to_string()),
        None => (LeadContext::default(), line.to_string()),
    }
}

/// Poll a job until it is terminal and print the outcome.
async fn watch_job(queue: Arc<dyn JobQueue>, job_id: String) {
    let mut interval = tokio::time::interval(WATCH_INTERVAL);
    loop {
        interval.tick().await;
        match queue.get_result(&job_id).await {
            Ok(result) if result.status.is_terminal() => {
                match result.status {
                    JobStatus::Completed => {
                        println!("\n[{job_id}] {}\n", result.result.unwrap_or_default());
                    }
                    _ => {
                        println!("\n[{job_id}] failed: {}\n", result.error.unwrap_or_default());
                    }
                }
                eprint!("> ");
                return;
            }
            Ok(_) => {}
            Err(QueueError::NotFound { .. }) => return,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to poll job");
                return;
            }
        }
    }
}
