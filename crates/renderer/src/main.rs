//! Netsink renderer — networked audio renderer for netsink DAC targets.
//!
//! Accepts transport commands over the HTTP control surface, decodes the
//! referenced audio (PCM via Symphonia, raw DSF/DFF natively), and
//! streams byte-exact samples to a netsink target discovered on the LAN,
//! with gapless transitions between same-format tracks.

mod cli;
mod config;
mod control;
mod engine;
mod events;
mod facade;
mod mdns;
mod runtime;
mod timefmt;

#[cfg(test)]
mod testsink;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::RendererConfig::from_args(&args);

    if args.list_targets {
        return list_targets(&config);
    }

    runtime::run(config)
}

fn list_targets(config: &config::RendererConfig) -> Result<()> {
    let targets = netsink::scan(&config.discovery)?;
    if targets.is_empty() {
        println!("No sink targets found on port {}", config.discovery.port);
        return Ok(());
    }

    println!("Available sink targets ({} found):", targets.len());
    for (index, target) in targets.iter().enumerate() {
        println!(
            "[{}] {} at {} (pcm bits: {:?}, dsd layouts: {})",
            index + 1,
            target.name,
            target.addr,
            target.caps.pcm_bits,
            target.caps.dsd_layouts.len()
        );
    }
    Ok(())
}

/// Bound a URI for log output without splitting a UTF-8 sequence.
pub(crate) fn truncate_uri(uri: &str) -> &str {
    match uri.char_indices().nth(96) {
        Some((idx, _)) => &uri[..idx],
        None => uri,
    }
}
