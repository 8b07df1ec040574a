//! HTTP API.
//!
//! Serves identity probes, inbound audio streams and the registry dump.
//! Every request that declares a sender identity is reported to the node so
//! unknown peers get registered.

use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::middleware::Next;
use actix_web::{Error, HttpRequest, HttpResponse, Responder, get, post, web};
use futures_util::StreamExt;
use futures_util::future::{LocalBoxFuture, Ready, ok};
use intercom_types::HealthResponse;

use crate::audio::AudioBackend;
use crate::config::{DEBUG_PATH, HEALTH_PATH, ID_HEADER};
use crate::identity::PeerId;
use crate::node::{NodeEvent, NodeHandle};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Shared state for HTTP handlers.
pub struct ApiState {
    pub self_id: PeerId,
    pub node: NodeHandle,
    pub audio: Arc<dyn AudioBackend>,
}

/// Register the intercom routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(identity)
        .service(receive_audio)
        .service(debug_dump)
        .service(health);
}

fn origin_of(headers: &HeaderMap) -> Option<PeerId> {
    headers
        .get(ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(PeerId::parse)
}

/// Report a declared sender identity to the node before routing.
pub async fn origin_bootstrap(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    if let (Some(origin), Some(peer), Some(state)) = (
        origin_of(req.headers()),
        req.peer_addr(),
        req.app_data::<web::Data<ApiState>>(),
    ) {
        state.node.send(NodeEvent::InboundOrigin {
            remote_host: peer.ip().to_canonical().to_string(),
            origin,
        });
    }
    next.call(req).await
}

#[get("/id")]
async fn identity(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type(TEXT_PLAIN)
        .body(format!("{}\r\n", state.self_id))
}

#[post("/intercom")]
async fn receive_audio(
    req: HttpRequest,
    state: web::Data<ApiState>,
    mut body: web::Payload,
) -> impl Responder {
    let Some(origin) = origin_of(req.headers()) else {
        return HttpResponse::BadRequest()
            .content_type(TEXT_PLAIN)
            .body(format!("missing {ID_HEADER} header\r\n"));
    };
    tracing::info!(peer_id = %origin, "intercom: receiving audio");

    state.audio.chime().await;
    let mut sink = match state.audio.open_playback().await {
        Ok(sink) => Some(sink),
        Err(e) => {
            tracing::warn!(peer_id = %origin, "intercom: playback unavailable: {e:#}");
            None
        }
    };

    let mut received: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(peer_id = %origin, error = %e, "intercom: body read failed");
                break;
            }
        };
        received += chunk.len() as u64;
        if let Some(playback) = sink.as_mut() {
            if let Err(e) = playback.write(chunk).await {
                tracing::warn!(peer_id = %origin, error = %e, "intercom: playback write failed");
                sink = None;
            }
        }
    }

    if let Some(playback) = sink {
        if let Err(e) = playback.finish().await {
            tracing::warn!(peer_id = %origin, error = %e, "intercom: playback close failed");
        }
    }
    tracing::info!(peer_id = %origin, bytes = received, "intercom: stream ended");
    HttpResponse::Ok().content_type(TEXT_PLAIN).body("OK")
}

#[get("/debug")]
async fn debug_dump(state: web::Data<ApiState>) -> impl Responder {
    let Some(snapshot) = state.node.snapshot().await else {
        return HttpResponse::ServiceUnavailable()
            .content_type(TEXT_PLAIN)
            .body("node stopped\r\n");
    };
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => HttpResponse::Ok()
            .content_type("application/json")
            .body(format!("{json}\r\n")),
        Err(e) => HttpResponse::InternalServerError()
            .content_type(TEXT_PLAIN)
            .body(format!("{e}\r\n")),
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    web::Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Fallback for unknown paths.
pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound()
        .content_type(TEXT_PLAIN)
        .body("Not found\r\n")
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    path != HEALTH_PATH && path != DEBUG_PATH
}

/// Actix middleware that filters noisy paths from logging.
pub struct FilteredLogger;

impl<S, B> Transform<S, ServiceRequest> for FilteredLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = FilteredLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FilteredLoggerMiddleware { service })
    }
}

/// Service wrapper that applies the logging filter.
pub struct FilteredLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for FilteredLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let should_log = should_log_path(&path);
        let method = req.method().clone();
        let peer = req
            .peer_addr()
            .map(|addr| addr.ip().to_canonical().to_string())
            .unwrap_or_else(|| "-".to_string());
        let origin = origin_of(req.headers())
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if should_log {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = %res.status().as_u16(),
                    peer = %peer,
                    peer_id = %origin,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "http request"
                );
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use actix_web::middleware::from_fn;
    use actix_web::{App, test as actix_test};
    use intercom_types::RegistrySnapshot;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::node::Node;
    use crate::testing::{FakeAudio, FakeConnector, FakeProbe};

    macro_rules! app {
        ($state:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data($state.clone())
                    .wrap(from_fn(origin_bootstrap))
                    .wrap(FilteredLogger)
                    .configure(configure)
                    .default_service(web::to(not_found)),
            )
            .await
        };
    }

    fn detached_state(audio: Arc<FakeAudio>) -> (web::Data<ApiState>, UnboundedReceiver<NodeEvent>) {
        let (node, rx) = NodeHandle::detached();
        let state = web::Data::new(ApiState {
            self_id: PeerId::from("SELF"),
            node,
            audio,
        });
        (state, rx)
    }

    #[actix_web::test]
    async fn id_returns_own_identity_with_crlf() {
        let (state, _rx) = detached_state(Arc::new(FakeAudio::default()));
        let app = app!(state);

        let req = actix_test::TestRequest::get().uri("/id").to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert_eq!(body, "SELF\r\n");
    }

    #[actix_web::test]
    async fn declared_origin_is_reported_with_remote_ip() {
        let (state, mut rx) = detached_state(Arc::new(FakeAudio::default()));
        let app = app!(state);

        let req = actix_test::TestRequest::get()
            .uri("/id")
            .insert_header((ID_HEADER, "peer-b"))
            .peer_addr("192.168.1.20:51000".parse().unwrap())
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        match rx.try_recv() {
            Ok(NodeEvent::InboundOrigin {
                remote_host,
                origin,
            }) => {
                assert_eq!(remote_host, "192.168.1.20");
                assert_eq!(origin, PeerId::from("peer-b"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[actix_web::test]
    async fn request_without_origin_reports_nothing() {
        let (state, mut rx) = detached_state(Arc::new(FakeAudio::default()));
        let app = app!(state);

        let req = actix_test::TestRequest::get()
            .uri("/id")
            .peer_addr("192.168.1.20:51000".parse().unwrap())
            .to_request();
        actix_test::call_service(&app, req).await;
        assert!(rx.try_recv().is_err());
    }

    #[actix_web::test]
    async fn intercom_requires_identity_header() {
        let audio = Arc::new(FakeAudio::default());
        let (state, _rx) = detached_state(audio.clone());
        let app = app!(state);

        let req = actix_test::TestRequest::post()
            .uri("/intercom")
            .set_payload("pcm")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(audio.chimes.load(Ordering::SeqCst), 0);
        assert!(audio.played.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn intercom_chimes_and_plays_body() {
        let audio = Arc::new(FakeAudio::default());
        let (state, _rx) = detached_state(audio.clone());
        let app = app!(state);

        let req = actix_test::TestRequest::post()
            .uri("/intercom")
            .insert_header((ID_HEADER, "peer-b"))
            .set_payload("raw-audio-bytes")
            .to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert_eq!(body, "OK");
        assert_eq!(audio.chimes.load(Ordering::SeqCst), 1);
        assert_eq!(audio.played.lock().unwrap().as_slice(), b"raw-audio-bytes");
        assert!(audio.playback_finished.load(Ordering::SeqCst));
    }

    #[actix_web::test]
    async fn intercom_drains_body_when_playback_fails() {
        let audio = Arc::new(FakeAudio::failing_playback());
        let (state, _rx) = detached_state(audio.clone());
        let app = app!(state);

        let req = actix_test::TestRequest::post()
            .uri("/intercom")
            .insert_header((ID_HEADER, "peer-b"))
            .set_payload("raw-audio-bytes")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(audio.played.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn debug_dumps_registry_from_node() {
        let (node, handle) = Node::new(
            PeerId::from("SELF"),
            Duration::from_secs(10),
            Arc::new(FakeProbe::default()),
            Arc::new(FakeAudio::default()),
            Arc::new(FakeConnector::default()),
        );
        let task = tokio::spawn(node.run());
        handle.send(NodeEvent::IdentityVerified {
            hostname: "pi-a.local".to_string(),
            identity: PeerId::from("A"),
        });

        let state = web::Data::new(ApiState {
            self_id: PeerId::from("SELF"),
            node: handle.clone(),
            audio: Arc::new(FakeAudio::default()),
        });
        let app = app!(state);

        let req = actix_test::TestRequest::get().uri("/debug").to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert!(body.ends_with(b"\r\n"));
        let snapshot: RegistrySnapshot = serde_json::from_slice(&body).expect("debug json");
        assert_eq!(snapshot.services.get("pi-a.local").map(String::as_str), Some("A"));
        assert_eq!(snapshot.services_set, vec!["A"]);

        handle.shutdown();
        task.await.expect("node task");

        let req = actix_test::TestRequest::get().uri("/debug").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let (state, _rx) = detached_state(Arc::new(FakeAudio::default()));
        let app = app!(state);

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let resp: HealthResponse = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.status, "ok");
    }

    #[actix_web::test]
    async fn unknown_path_is_not_found() {
        let (state, _rx) = detached_state(Arc::new(FakeAudio::default()));
        let app = app!(state);

        let req = actix_test::TestRequest::get().uri("/nope").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
        let body = actix_test::read_body(resp).await;
        assert_eq!(body, "Not found\r\n");
    }

    #[test]
    fn should_log_path_skips_polling_endpoints() {
        assert!(!should_log_path("/health"));
        assert!(!should_log_path("/debug"));
        assert!(should_log_path("/intercom"));
        assert!(should_log_path("/id"));
    }
}
