// External crates
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::CONTENT_TYPE,
    http::{Method, Request, Response, StatusCode},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as HyperServerBuilder,
};
use prometheus::{Encoder, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;

async fn metrics_handler(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    // Gather all registered metrics and encode them into the Prometheus
    // text exposition format.
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode prometheus metrics");
        return Ok(build_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::from_static(b"encoding error"),
            None,
        ));
    }

    Ok(build_response(
        StatusCode::OK,
        Bytes::from(buffer),
        Some(encoder.format_type().to_string()),
    ))
}

fn build_response(
    status: StatusCode,
    body: Bytes,
    content_type: Option<String>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }
    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Serve `GET /metrics` on the configured address until the surrounding task
/// is dropped or an accept error occurs.
pub async fn start_metrics_server(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics listen address {addr:?}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;

    tracing::info!(metrics_endpoint = %addr, "Metrics available at http://{addr}/metrics");

    loop {
        let (stream, _) = listener.accept().await.context("metrics accept failed")?;
        let io = TokioIo::new(stream);

        let service = service_fn(|req: Request<Incoming>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/metrics") => metrics_handler(req).await,
                _ => Ok(build_response(
                    StatusCode::NOT_FOUND,
                    Bytes::from_static(b"Not Found"),
                    None,
                )),
            }
        });

        tokio::spawn(async move {
            if let Err(err) = HyperServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::error!(error = %err, "Metrics server connection error");
            }
        });
    }
}
