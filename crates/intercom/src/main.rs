//! Intercom: push-to-talk audio broadcast between devices on a LAN.
//!
//! Each device advertises itself over mDNS, learns its peers' identities and,
//! while its button is held, streams microphone audio to every known peer.
//! Incoming streams are played through the local speaker.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use intercom::{cli, config, runtime};

#[actix_web::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,intercom=info,actix_web=warn")
        }))
        .init();

    let cfg = match args.config.as_ref() {
        Some(path) => config::IntercomConfig::load(path)?,
        None => config::IntercomConfig::default(),
    };
    let run = config::resolve(&cfg, args.http_bind, !args.no_button);
    runtime::run(run).await
}
