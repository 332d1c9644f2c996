use crate::JsonClient;
use futures::{stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use service_graph_core::{Error, Result, TimeRange};
use service_graph_flows::{
    Backend, Buckets, DnsBucket, FlowConfig, L3Bucket, L7Bucket, RawEvent,
};
use tracing::{debug, warn};

/// Reads pre-aggregated records from the log store gateway.
///
/// Records are fetched a page at a time. A page the store marks as truncated ends the stream
/// with [`Error::DataTruncated`].
#[derive(Clone, Debug)]
pub struct LogStore {
    client: JsonClient,
    page_size: usize,
}

#[derive(Clone, Debug, Serialize)]
struct PageRequest {
    time_range: TimeRange,
    size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,

    /// Where the next page starts. Absent on the last page.
    #[serde(default)]
    after: Option<serde_json::Value>,

    #[serde(default)]
    truncated: bool,
}

// === impl LogStore ===

impl LogStore {
    pub fn new(client: JsonClient, page_size: usize) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }

    fn pages<T>(&self, cluster: &str, kind: &str, range: &TimeRange) -> Buckets<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        let path = format!("/clusters/{cluster}/{kind}");
        let first = PageRequest {
            time_range: range.clone(),
            size: self.page_size,
            after: None,
        };
        stream::unfold(Some(first), move |next| {
            let client = client.clone();
            let path = path.clone();
            async move {
                let mut req = next?;
                let page = match client.post::<_, Page<T>>(&path, None, &req).await {
                    Ok(page) => page,
                    Err(error) => return Some((vec![Err(error)], None)),
                };
                debug!(%path, items = page.items.len(), "Read page");
                let mut items = page.items.into_iter().map(Ok).collect::<Vec<_>>();
                if page.truncated {
                    items.push(Err(Error::DataTruncated));
                    return Some((items, None));
                }
                let next = page.after.map(|after| {
                    req.after = Some(after);
                    req
                });
                Some((items, next))
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

#[async_trait::async_trait]
impl Backend for LogStore {
    async fn flow_config(&self, cluster: &str) -> Result<FlowConfig> {
        self.client
            .post(&format!("/clusters/{cluster}/flow-config"), None, &())
            .await
    }

    async fn l3_flows(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<L3Bucket>> {
        Ok(self.pages(cluster, "l3", range))
    }

    async fn l7_flows(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<L7Bucket>> {
        Ok(self.pages(cluster, "l7", range))
    }

    async fn dns_logs(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<DnsBucket>> {
        Ok(self.pages(cluster, "dns", range))
    }

    async fn events(&self, cluster: &str, range: &TimeRange) -> Result<Vec<RawEvent>> {
        let mut pages = self.pages::<RawEvent>(cluster, "events", range);
        let mut events = Vec::new();
        while let Some(event) = pages.next().await {
            match event {
                Ok(event) => events.push(event),
                Err(Error::DataTruncated) => {
                    warn!(events = events.len(), "Events truncated");
                    break;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{self, Body};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use http_body_util::BodyExt;
    use hyper::{body::Incoming, Request, Response, StatusCode};
    use serde_json::json;
    use std::{
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::net::TcpListener;

    /// Serves two pages of HTTP records, the second of them truncated.
    #[derive(Clone, Default)]
    struct Gateway {
        requests: Arc<parking_lot::Mutex<Vec<serde_json::Value>>>,
    }

    impl tower::Service<Request<Incoming>> for Gateway {
        type Response = Response<Body>;
        type Error = hyper::Error;
        type Future = BoxFuture<'static, Result<Response<Body>, hyper::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), hyper::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Incoming>) -> Self::Future {
            let requests = self.requests.clone();
            Box::pin(async move {
                let path = req.uri().path().to_string();
                let bytes = req.into_body().collect().await?.to_bytes();
                let body = serde_json::from_slice::<serde_json::Value>(&bytes).unwrap_or_default();
                requests.lock().push(body.clone());

                let rsp = match (path.as_str(), body["after"].as_u64()) {
                    ("/clusters/c1/flow-config", _) => json!({
                        "l3_flush_interval": 300,
                        "l7_flush_interval": 60,
                        "dns_flush_interval": 60,
                    }),
                    ("/clusters/c1/l7", None) => json!({
                        "items": [{"response_code": "200", "count": 1}],
                        "after": 1,
                    }),
                    ("/clusters/c1/l7", Some(1)) => json!({
                        "items": [{"response_code": "500", "count": 2}],
                        "truncated": true,
                    }),
                    ("/clusters/c1/events", _) => json!({"items": [{"id": "e1"}]}),
                    _ => {
                        let mut rsp = Response::new(Body::from("no such cluster"));
                        *rsp.status_mut() = StatusCode::NOT_FOUND;
                        return Ok(rsp);
                    }
                };
                Ok(Response::new(Body::from(Bytes::from(rsp.to_string()))))
            })
        }
    }

    async fn store(gateway: Gateway) -> LogStore {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener must bind");
        let addr = listener.local_addr().expect("listener must be bound");
        tokio::spawn(server::serve(listener, gateway));
        let base = format!("http://{addr}/").parse().expect("url must parse");
        LogStore::new(JsonClient::new(&base), 1)
    }

    fn range() -> TimeRange {
        TimeRange {
            from: "2026-01-01T10:00:00Z".parse().expect("must parse"),
            to: "2026-01-01T10:15:00Z".parse().expect("must parse"),
            now: None,
        }
    }

    #[tokio::test]
    async fn reads_pages_until_truncated() {
        let gateway = Gateway::default();
        let store = store(gateway.clone()).await;

        let config = store.flow_config("c1").await.expect("config must be read");
        assert_eq!(config.l3_flush_interval, Duration::from_secs(300));

        let records = store
            .l7_flows("c1", &range())
            .await
            .expect("query must start")
            .collect::<Vec<_>>()
            .await;
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].as_ref().map(|b| b.response_code.as_str()),
            Ok("200")
        );
        assert_eq!(
            records[1].as_ref().map(|b| b.count),
            Ok(2)
        );
        assert_eq!(records[2], Err(Error::DataTruncated));

        let requests = gateway.requests.lock().clone();
        assert_eq!(requests[1]["size"], 1);
        assert_eq!(requests[1]["after"], serde_json::Value::Null);
        assert_eq!(requests[2]["after"], 1);
    }

    #[tokio::test]
    async fn reads_events() {
        let store = store(Gateway::default()).await;
        let events = store.events("c1", &range()).await.expect("events must be read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "e1");
    }

    #[tokio::test]
    async fn reports_gateway_errors() {
        let store = store(Gateway::default()).await;
        let err = store.flow_config("c2").await.expect_err("cluster is unknown");
        assert!(
            matches!(&err, Error::Backend(msg) if msg.contains("404") && msg.contains("no such cluster")),
            "{err}"
        );
    }
}
