// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! HTTP endpoints: Prometheus exposition, health, status.
//!
//! Readers only touch the snapshot store and the loader's status handle, so
//! a slow scrape can never block the pipeline.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::loader::StatusHandle;
use crate::render;
use crate::snapshot::SnapshotStore;

static NOTFOUND: &[u8] = b"Not found";

#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<SnapshotStore>,
    pub status: StatusHandle,
    pub started_at: Instant,
}

impl ServerContext {
    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

fn text_response(
    status: StatusCode,
    content_type: &str,
    body: Vec<u8>,
) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("failed to build response: {e}"))
}

fn json_response(
    status: StatusCode,
    value: serde_json::Value,
) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    let body = serde_json::to_vec(&value).unwrap_or_else(|e| {
        error!("failed to serialize response: {e}");
        b"{}".to_vec()
    });
    text_response(status, "application/json", body)
}

fn not_found() -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    text_response(StatusCode::NOT_FOUND, "text/plain", NOTFOUND.to_vec())
}

fn handle_metrics(ctx: &ServerContext) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    let snapshot = ctx.store.load();
    let text = render::render_prometheus(snapshot.as_deref(), ctx.uptime_seconds());
    text_response(
        StatusCode::OK,
        "text/plain; version=0.0.4",
        text.into_bytes(),
    )
}

fn handle_health(ctx: &ServerContext) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    let healthy = ctx.status.is_healthy();
    let (status, label) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    json_response(
        status,
        json!({
            "status": label,
            "timestamp": rfc3339(SystemTime::now()),
        }),
    )
}

fn handle_status(ctx: &ServerContext) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    let snapshot = ctx.store.load();
    let maps: Vec<serde_json::Value> = crate::maps::MAP_SPECS
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "kind": spec.kind.as_str(),
                "capacity": spec.capacity,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": ctx.status.state().as_str(),
            "uptime_seconds": ctx.uptime_seconds(),
            "containers_monitored": snapshot.as_ref().map(|s| s.containers.len()).unwrap_or(0),
            "memory_usage_bytes": snapshot.as_ref().map(|s| s.memory_usage_bytes).unwrap_or(0),
            "ebpf_maps_count": snapshot.as_ref().map(|s| s.kernel_maps_count).unwrap_or(0),
            "last_update": snapshot.as_ref().map(|s| rfc3339(s.taken_at)),
            "maps": maps,
        }),
    )
}

async fn handle_request(
    ctx: ServerContext,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, std::io::Error>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => handle_metrics(&ctx),
        (&Method::GET, "/health") => handle_health(&ctx),
        (&Method::GET, "/status") => handle_status(&ctx),
        _ => not_found(),
    }
}

/// Serve until shutdown. Each connection gets its own task; handlers are
/// wait-free against the pipeline.
pub async fn serve(
    listener: TcpListener,
    ctx: ServerContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("http server listening on {:?}", listener.local_addr());
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let ctx = ctx.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let ctx = ctx.clone();
                        async move {
                            Ok::<_, anyhow::Error>(handle_request(ctx, req).await.unwrap_or_else(|e| {
                                error!("request handling failed: {e}");
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(
                                        Full::new(Bytes::from_static(b"Internal Server Error"))
                                            .map_err(|e| match e {})
                                            .boxed(),
                                    )
                                    .unwrap_or_else(|_| {
                                        Response::new(
                                            Full::new(Bytes::from_static(b"Error"))
                                                .map_err(|e| match e {})
                                                .boxed(),
                                        )
                                    })
                            }))
                        }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("error serving connection: {err}");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http server shutting down");
                    return Ok(());
                }
            }
        }
    }
}
