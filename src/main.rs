//! Main entry point for the fastheader CLI application.
//!
//! Extracts header metadata for every source given on the command line and
//! prints the results as JSON. Diagnostics go to stderr through `tracing`
//! (`RUST_LOG=debug` shows every fetch).

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use fastheader::{AsyncExtractor, Cli, ExtractOptions, Extractor, HeaderResult, Origin};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let sources = collect_sources(&cli.sources)?;
    let options = cli.options();

    // The blocking transport owns a runtime, which cannot live inside another one.
    let results = if cli.sync {
        extract_blocking(&sources, options)?
    } else {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start the async runtime")?;
        runtime.block_on(extract_concurrent(&sources, options))?
    };

    write_results(&cli, &results)?;

    if results.iter().any(|r| !r.success) {
        std::process::exit(1);
    }
    Ok(())
}

/// Expand `-` into the non-empty lines of stdin.
fn collect_sources(args: &[String]) -> Result<Vec<Origin>> {
    let mut sources = Vec::new();
    for arg in args {
        if arg == "-" {
            for line in io::stdin().lock().lines() {
                let line = line.context("failed to read sources from stdin")?;
                let line = line.trim();
                if !line.is_empty() {
                    sources.push(Origin::parse(line));
                }
            }
        } else {
            sources.push(Origin::parse(arg));
        }
    }
    Ok(sources)
}

fn extract_blocking(sources: &[Origin], options: ExtractOptions) -> Result<Vec<HeaderResult>> {
    let extractor = Extractor::new(options).context("failed to build the HTTP client")?;
    Ok(sources.iter().map(|origin| extractor.extract(origin)).collect())
}

/// Run every extraction concurrently, keeping results in input order.
async fn extract_concurrent(sources: &[Origin], options: ExtractOptions) -> Result<Vec<HeaderResult>> {
    let extractor =
        Arc::new(AsyncExtractor::new(options).context("failed to build the HTTP client")?);

    let mut tasks = JoinSet::new();
    for (index, origin) in sources.iter().cloned().enumerate() {
        let extractor = Arc::clone(&extractor);
        tasks.spawn(async move { (index, extractor.extract(&origin).await) });
    }

    let mut results: Vec<Option<HeaderResult>> = vec![None; sources.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.context("extraction task panicked")?;
        results[index] = Some(result);
    }
    Ok(results.into_iter().flatten().collect())
}

/// Serialize a result, keeping only the requested data fields.
fn render(result: &HeaderResult, fields: &[String]) -> Result<Value> {
    let mut value = serde_json::to_value(result)?;
    if !fields.is_empty()
        && let Some(Value::Object(data)) = value.get_mut("data")
    {
        data.retain(|key, _| fields.iter().any(|f| f == key));
    }
    Ok(value)
}

fn write_results(cli: &Cli, results: &[HeaderResult]) -> Result<()> {
    let out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(out);

    if cli.line_output(results.len()) {
        for result in results {
            serde_json::to_writer(&mut out, &render(result, &cli.fields)?)?;
            writeln!(out)?;
        }
    } else {
        for result in results {
            serde_json::to_writer_pretty(&mut out, &render(result, &cli.fields)?)?;
            writeln!(out)?;
        }
    }

    out.flush()?;
    Ok(())
}
