use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nors_advisor::QuotaEngine;
use nors_pipeline::{
    load_profiles, load_tier_limits, EnrichmentWatermark, Pipeline, PipelineConfig,
};
use nors_web::AppState;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "nors-cli")]
#[command(about = "NORS command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One full sweep: ingest, enrich, rescore, checkpoint, report.
    Ingest,
    /// Enrich the pending pool against the last watermark.
    Enrich,
    /// Rescore every known facility.
    Score,
    /// Serve the JSON API, with the cron scheduler when enabled.
    Serve,
    /// Print recent run summaries.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let pipeline = Pipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} sources={} enriched={} failed={} scored={}",
                summary.run_id,
                summary.sources.len(),
                summary.enriched,
                summary.enrichment_failures,
                summary.scored_facilities
            );
        }
        Commands::Enrich => {
            let pipeline = Pipeline::from_config(config).await?;
            let previous = EnrichmentWatermark::load(&pipeline.config().watermark_path).await?;
            let report = pipeline.run_enrichment(Uuid::new_v4(), previous).await?;
            pipeline.save_checkpoint().await?;
            println!(
                "enrichment complete: enriched={} failed={} permanently_failed={}",
                report.enriched, report.failed, report.permanently_failed
            );
        }
        Commands::Score => {
            let pipeline = Pipeline::from_config(config).await?;
            let scored = pipeline.score_all(Utc::now()).await?;
            pipeline.save_checkpoint().await?;
            println!("scoring complete: facilities={scored}");
        }
        Commands::Serve => {
            let port: u16 = std::env::var("NORS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let root = config.workspace_root.clone();
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            if let Some(sched) = pipeline.maybe_build_scheduler().await? {
                sched.start().await.context("starting scheduler")?;
            }
            let state = AppState::new(
                pipeline.job_store(),
                pipeline.facility_store(),
                load_profiles(&root)?,
                Arc::new(QuotaEngine::new(load_tier_limits(&root)?)),
                pipeline.config().freshness(),
            );
            println!("serving on 0.0.0.0:{port}");
            nors_web::serve(state, port).await?;
        }
        Commands::Report => {
            let reports_root = config.workspace_root.join("reports");
            let mut entries = match std::fs::read_dir(&reports_root) {
                Ok(entries) => entries.filter_map(|e| e.ok()).collect::<Vec<_>>(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading {}", reports_root.display()));
                }
            };
            entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
            entries.reverse();

            for entry in entries.into_iter().take(20) {
                let path = entry.path().join("run_summary.json");
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let summary: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                println!(
                    "{} sources={} enriched={} failed={} scored={}",
                    summary["run_id"].as_str().unwrap_or("?"),
                    summary["sources"].as_array().map(|a| a.len()).unwrap_or(0),
                    summary["enriched"],
                    summary["enrichment_failures"],
                    summary["scored_facilities"]
                );
            }
        }
    }

    Ok(())
}
