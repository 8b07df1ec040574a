use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "intercom", version)]
pub struct Args {
    /// Optional config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// HTTP API bind address, e.g. 0.0.0.0:4242 (overrides `port` from the config)
    #[arg(long)]
    pub http_bind: Option<SocketAddr>,

    /// Run without the GPIO push button (receive-only)
    #[arg(long)]
    pub no_button: bool,
}
