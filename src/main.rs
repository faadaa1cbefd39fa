use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

mod app;
mod cache;
mod catalog;
mod cli;
mod config;
mod fingerprint;
mod identify;
mod import;
mod ingest;
mod matching;
mod metadata;
mod retry;
mod singleflight;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::AppFactory;
use cli::{CacheArgs, Command};

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cratedig=info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_image(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();

    let paths = AppFactory::get_paths()?;
    let app = Arc::new(AppFactory::create_app(&paths)?);

    match args.command {
        Command::Daemon { listen } => {
            web::start_daemon(app, listen)?;
        }

        Command::Identify { image } => {
            let image = read_image(&image)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let result = runtime.block_on(app.identify(image))?;
            print_json(&result)?;
        }

        Command::Ingest { ids } => {
            let report = if ids.is_empty() {
                app.ingest_all()?
            } else {
                app.ingest(&ids)
            };
            print_json(&report)?;

            if !report.is_complete_success() {
                anyhow::bail!("{} of {} items failed", report.failed().count(), report.items.len());
            }
        }

        Command::Add {
            title,
            image,
            parent,
        } => {
            let image = read_image(&image)?;
            let (item, ingest) = app.add_item(title, parent, &image)?;
            print_json(&serde_json::json!({"item": item, "ingest": ingest}))?;
        }

        Command::Import { csv } => {
            let report = app.import_csv(&csv)?;
            print_json(&report)?;

            let failed = report.skipped() + report.ingest.failed().count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} rows were not imported", report.rows.len());
            }
        }

        Command::SetImage { id, image } => {
            let image = read_image(&image)?;
            let (item, ingest) = app.replace_image(id, &image)?;
            print_json(&serde_json::json!({"item": item, "ingest": ingest}))?;
        }

        Command::Remove { id } => {
            if !app.remove_item(id)? {
                anyhow::bail!("item {id} not found");
            }
            println!("removed item {id}");
        }

        Command::Metadata { query, sources } => {
            let (collected, comparison) = app.metadata(&query, sources.as_deref())?;
            print_json(&serde_json::json!({
                "query": collected.query,
                "sources": collected.sources,
                "identical": comparison.identical,
                "differences": comparison.differences,
            }))?;
        }

        Command::Cache(CacheArgs::Purge { all }) => {
            let removed = app.purge_cache(all)?;
            println!("removed {removed} cache entries");
        }
    }

    Ok(())
}
