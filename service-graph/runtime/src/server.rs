use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, Request, Response};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, debug_span, info, warn, Instrument};

pub(crate) type Body = Full<Bytes>;

pub(crate) async fn bind(name: &str, addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} server to {addr}"))?;
    info!(addr = %listener.local_addr()?, "{name} server listening");
    Ok(listener)
}

/// Serves HTTP/1 connections until the task is dropped.
pub(crate) async fn serve<S>(listener: TcpListener, svc: S)
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        let (io, client) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "Failed to accept connection");
                continue;
            }
        };
        let svc = TowerToHyperService::new(svc.clone());
        tokio::spawn(
            async move {
                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    debug!(%error, "Connection failed");
                }
            }
            .instrument(debug_span!("conn", %client)),
        );
    }
}
