//! Intercom runtime.
//!
//! Wires the node, the HTTP server, mDNS and the button together and tears
//! them down in order on Ctrl-C / SIGTERM.

use std::sync::Arc;

use actix_web::middleware::from_fn;
use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};

use crate::audio::{AudioBackend, ProcessAudio};
use crate::button::{ButtonConfig, ButtonPoller, spawn_button_poller};
use crate::config::{IntercomRunConfig, STREAM_OPEN_TIMEOUT};
use crate::http_api::{self, ApiState, FilteredLogger};
use crate::identity::PeerId;
use crate::mdns::{spawn_mdns_browser, spawn_mdns_publisher};
use crate::node::{Node, NodeHandle};
use crate::transport::HttpPeerConnector;
use crate::verify::HttpIdentityProbe;

/// Run until a termination signal arrives.
pub async fn run(config: IntercomRunConfig) -> Result<()> {
    let self_id = PeerId::generate();
    let port = config.port();
    tracing::info!(
        peer_id = %self_id,
        http_bind = %config.http_bind,
        recording_timeout_ms = config.recording_timeout.as_millis() as u64,
        "intercom: starting"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(STREAM_OPEN_TIMEOUT)
        .build()
        .context("build http client")?;
    let probe = Arc::new(HttpIdentityProbe::new(client.clone(), port, self_id.clone()));
    let connector = Arc::new(HttpPeerConnector::new(client, port, self_id.clone()));
    let audio: Arc<dyn AudioBackend> = Arc::new(ProcessAudio::new(config.audio.clone()));

    let (node, handle) = Node::new(
        self_id.clone(),
        config.recording_timeout,
        probe,
        audio.clone(),
        connector,
    );
    let node_task = tokio::spawn(node.run());
    setup_shutdown(handle.clone());

    let state = web::Data::new(ApiState {
        self_id: self_id.clone(),
        node: handle.clone(),
        audio,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(from_fn(http_api::origin_bootstrap))
            .wrap(FilteredLogger)
            .configure(http_api::configure)
            .default_service(web::to(http_api::not_found))
    })
    .disable_signals()
    .bind(config.http_bind)
    .with_context(|| format!("bind {}", config.http_bind))?
    .run();
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);
    tracing::info!(bind = %config.http_bind, "http: listening");

    let interface = config.mdns_interface.as_deref();
    let publisher = spawn_mdns_publisher(port, &self_id, interface);
    let browser = spawn_mdns_browser(handle.clone(), interface);
    let button = config
        .button
        .as_ref()
        .and_then(|button| start_button(button, handle.clone()));

    if let Err(e) = node_task.await {
        tracing::warn!(error = %e, "node task failed");
    }

    tracing::info!("intercom: shutting down");
    let released = tokio::task::spawn_blocking(move || {
        if let Some(button) = button {
            button.shutdown();
        }
        if let Some(browser) = browser {
            browser.shutdown();
        }
        if let Some(publisher) = publisher {
            publisher.shutdown();
        }
    })
    .await;
    if let Err(e) = released {
        tracing::warn!(error = %e, "shutdown of background threads failed");
    }
    server_handle.stop(true).await;
    if let Ok(Err(e)) = server_task.await {
        tracing::warn!(error = %e, "http server exited with error");
    }
    tracing::info!("intercom: stopped");
    Ok(())
}

fn start_button(config: &ButtonConfig, node: NodeHandle) -> Option<ButtonPoller> {
    match spawn_button_poller(config, move |edge| {
        node.button(edge);
    }) {
        Ok(poller) => Some(poller),
        Err(e) => {
            tracing::warn!(pin = config.pin, "button unavailable, running receive-only: {e:#}");
            None
        }
    }
}

/// First signal asks the node to stop; a second one exits immediately.
fn setup_shutdown(node: NodeHandle) {
    if let Err(e) = ctrlc::set_handler(move || {
        if !node.shutdown() {
            std::process::exit(130);
        }
    }) {
        tracing::warn!(error = %e, "signal handler not installed");
    }
}
