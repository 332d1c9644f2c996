use crate::server::Body;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use http_body_util::BodyExt;
use hyper::{
    body::Body as HttpBody,
    header::{self, HeaderValue},
    Method, Request, Response, StatusCode,
};
use serde::Serialize;
use service_graph_cache::{Authorizer, ServiceGraphCache};
use service_graph_core::request::ServiceGraphRequest;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub const SERVICE_GRAPH_PATH: &str = "/service-graph";

/// Creates the authorizer for a request from the caller's bearer token.
pub trait NewAuthorizer: Clone + Send + Sync + 'static {
    type Authorizer: Authorizer + 'static;

    fn new_authorizer(&self, token: Option<&str>) -> Self::Authorizer;
}

/// Serves service graph requests from the cache.
#[derive(Clone)]
pub struct Api<N> {
    cache: ServiceGraphCache,
    authz: N,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

// === impl Api ===

impl<N: NewAuthorizer> Api<N> {
    pub fn new(cache: ServiceGraphCache, authz: N) -> Self {
        Self { cache, authz }
    }

    async fn service_graph<B>(self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: HttpBody<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Request(e.into()))?
            .to_bytes();

        let req = match serde_json::from_slice::<ServiceGraphRequest>(&bytes) {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return json(
                    StatusCode::BAD_REQUEST,
                    &ErrorBody {
                        error: format!("invalid request: {error}"),
                        retryable: false,
                    },
                );
            }
        };
        trace!(?req);

        let authz = self.authz.new_authorizer(token.as_deref());
        match self.cache.service_graph(&req, &authz).await {
            Ok(graph) => json(StatusCode::OK, &graph),
            Err(error) => {
                let status = status(&error);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(%error, "Failed to build service graph");
                } else {
                    info!(%error, %status, "Service graph request failed");
                }
                let error = match error {
                    service_graph_core::Error::Internal(_) => "internal error".to_string(),
                    error => error.to_string(),
                };
                json(
                    status,
                    &ErrorBody {
                        retryable: status == StatusCode::SERVICE_UNAVAILABLE,
                        error,
                    },
                )
            }
        }
    }
}

impl<N, B> tower::Service<Request<B>> for Api<N>
where
    N: NewAuthorizer,
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        debug!(method = %req.method(), path = req.uri().path(), "Request");
        if req.uri().path() != SERVICE_GRAPH_PATH {
            return Box::pin(future::ok(empty(StatusCode::NOT_FOUND)));
        }
        if req.method() != Method::POST {
            return Box::pin(future::ok(empty(StatusCode::METHOD_NOT_ALLOWED)));
        }
        Box::pin(self.clone().service_graph(req))
    }
}

fn status(error: &service_graph_core::Error) -> StatusCode {
    use service_graph_core::Error;
    match error {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        Error::CacheTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Backend(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>, Error> {
    let mut rsp = Response::new(Body::from(serde_json::to_vec(body)?));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = status;
    rsp
}
