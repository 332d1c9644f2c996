use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Request, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::{de::DeserializeOwned, Serialize};
use service_graph_core::{Error, Result};
use std::fmt;
use tracing::trace;

/// Posts JSON to a service and decodes its JSON response.
///
/// Transport and decoding failures are reported as backend errors.
#[derive(Clone, Debug)]
pub struct JsonClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
}

// === impl JsonClient ===

impl JsonClient {
    pub fn new(base: &Uri) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: base.to_string().trim_end_matches('/').to_string(),
        }
    }

    pub async fn post<T, R>(&self, path: &str, token: Option<&str>, body: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let uri = format!("{}{path}", self.base);
        let body = serde_json::to_vec(body).map_err(backend)?;
        let mut req = Request::post(&uri).header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = req.body(Full::new(Bytes::from(body))).map_err(backend)?;

        let rsp = self.client.request(req).await.map_err(backend)?;
        let status = rsp.status();
        let bytes = rsp.into_body().collect().await.map_err(backend)?.to_bytes();
        trace!(%uri, %status, len = bytes.len(), "Response");
        if !status.is_success() {
            return Err(Error::Backend(format!(
                "{uri}: {status}: {}",
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        serde_json::from_slice(&bytes).map_err(|error| Error::Backend(format!("{uri}: {error}")))
    }
}

fn backend(error: impl fmt::Display) -> Error {
    Error::Backend(error.to_string())
}
