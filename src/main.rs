use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

mod cache;
mod cli;
mod extract;
mod fetch;
mod quota;
mod rewrite;
mod session;

use cli::CaptureCommand;
use session::{CaptureSession, SessionOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = CaptureCommand::parse();
    let options = args.to_options();

    let session = CaptureSession::new(&args.url, &args.cache_dir, options)?;
    let report = session.run().await?;

    match report.outcome {
        SessionOutcome::Completed => {
            println!("{} Capture completed for {}", "✓".green(), report.root_url);
        }
        SessionOutcome::Aborted => {
            println!(
                "{} Capture aborted for {} (quota reached or cancelled); partial mirror kept",
                "!".yellow(),
                report.root_url
            );
        }
    }
    println!(
        "  {} page(s), {} resource(s), {} byte(s) downloaded",
        report.pages_cached, report.resources_cached, report.bytes_downloaded
    );
    println!("  Cache directory: {:?}", args.cache_dir);
    println!("  Navigation index stored under key {}", cache::INDEX_KEY.bold());

    if !report.errors.is_empty() {
        println!("{} {} resource(s) could not be captured:", "!".yellow(), report.errors.len());
        for failure in &report.errors {
            println!("  {} {}: {}", "-".yellow(), failure.url, failure.reason);
        }
    }

    Ok(())
}
