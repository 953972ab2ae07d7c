use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use feedpool::{Config, ParallelProcessor, ProcessingStatus};

#[derive(Parser, Debug)]
#[command(
    name = "feedpool",
    about = "Fetch RSS/Atom/JSON feeds with bounded concurrency"
)]
struct Args {
    /// Config file with processor settings and [[sources]]
    #[arg(long, value_name = "FILE", default_value = "feedpool.toml")]
    config: PathBuf,

    /// Override the initial worker count (clamped to 1..=20)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Sample host load and tune concurrency before fetching
    #[arg(long)]
    adapt: bool,

    /// Print the batch plan instead of fetching
    #[arg(long)]
    plan: bool,

    /// Retry failed sources out of band after the batch
    #[arg(long)]
    failover: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if config.sources.is_empty() {
        eprintln!("Warning: no [[sources]] in {}", args.config.display());
    }

    let processor = ParallelProcessor::new(config.clone()).context("Failed to build HTTP client")?;
    if let Some(n) = args.concurrency {
        let applied = processor.set_max_concurrency(n);
        tracing::debug!(requested = n, applied = applied, "Concurrency override");
    }

    if args.adapt {
        let tuned = processor.sample_and_adapt().await;
        tracing::info!(max_concurrency = tuned.max_concurrency, "Concurrency tuned from host load");
    }

    if args.plan {
        let plan = processor.distribute_processing_load(&config.sources);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            for batch in &plan.batches {
                let ids: Vec<&str> = batch.sources.iter().map(|s| s.id.as_str()).collect();
                println!(
                    "batch {} (priority {}, ~{}ms): {}",
                    batch.batch_id,
                    batch.priority,
                    batch.estimated_completion.as_millis(),
                    ids.join(", ")
                );
            }
            println!(
                "total ~{}ms across {} batches",
                plan.total_estimated_time.as_millis(),
                plan.batches.len()
            );
        }
        return Ok(());
    }

    let results = processor.process_parallel_feeds(&config.sources).await;

    let recovered = if args.failover {
        let failed: Vec<_> = results
            .iter()
            .filter(|r| r.status != ProcessingStatus::Success)
            .filter_map(|r| processor.source_by_id(&r.source_id))
            .collect();
        processor.handle_failover_retry(&failed).await
    } else {
        Vec::new()
    };

    if args.json {
        let report = serde_json::json!({
            "results": results,
            "failover": recovered,
            "optimization": processor.optimize_resource_allocation(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for result in &results {
        match &result.error {
            None => println!(
                "{:<20} {:?} {} items in {}ms",
                result.source_id,
                result.status,
                result.items.len(),
                result.processing_time.as_millis()
            ),
            Some(error) => println!(
                "{:<20} {:?} (attempt {}): {}",
                result.source_id, result.status, result.attempt, error
            ),
        }
    }
    for retry in &recovered {
        println!(
            "{:<20} failover {} after {} attempts ({}ms)",
            retry.source_id,
            if retry.success { "recovered" } else { "gave up" },
            retry.attempts,
            retry.recovery_time.as_millis()
        );
    }

    for rec in processor.optimize_resource_allocation().recommendations {
        println!("hint [{}]: {}", rec.area, rec.action);
    }

    Ok(())
}
