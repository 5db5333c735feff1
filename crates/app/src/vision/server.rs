//! Actix Web preview server exposing the MJPEG stream and detection APIs.
//!
//! The server runs on a dedicated thread to keep the pipeline hot path free
//! from Actix runtime concerns. Endpoints never surface pipeline faults:
//! while the pipeline is degraded they serve empty or stale data.

use std::{sync::Arc, time::Duration};

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::error;

use crate::vision::{
    config::Settings,
    data::BoxesResponse,
    pipeline::{self, PipelineQuery},
    telemetry,
};

/// Shared state backing HTTP handlers.
struct ServerState {
    query: PipelineQuery,
    settings: Arc<Settings>,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
pub fn spawn_preview_server(query: PipelineQuery, settings: Arc<Settings>) -> Result<PreviewServer> {
    let listen_addr = settings.listen_addr.clone();
    let server_query = query;
    let server_settings = settings;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("vision-preview-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            query: server_query.clone(),
                            settings: server_settings.clone(),
                        }))
                        .route("/", web::get().to(index_handler))
                        .route("/health", web::get().to(health_handler))
                        .route("/video/feed", web::get().to(stream_handler))
                        .route("/detections/latest", web::get().to(detections_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(listen_addr.as_str())?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn preview server thread")?;
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn index_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": format!("{} running", state.settings.service_name),
        "stream": "/video/feed",
        "health": "/health",
    }))
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": state.settings.service_name,
    }))
}

/// Return the most recently published boxes as `{count, boxes}`.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    let boxes = state.query.latest_boxes();
    HttpResponse::Ok().json(BoxesResponse {
        count: boxes.len(),
        boxes,
    })
}

/// Stream the MJPEG feed over a multipart replace response.
///
/// Each connection is an independent reader of the shared latest frame; a
/// slow consumer only sees staler snapshots, it never backs up the producer.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        loop {
            match state.query.latest_packet() {
                Some(packet) => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(pipeline::mjpeg_chunk(&packet)));
                    actix_web::rt::time::sleep(Duration::from_millis(33)).await;
                }
                None => {
                    actix_web::rt::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::Ok()
            .content_type("text/plain")
            .body(String::new()),
    }
}
