//! Aggregates DNS log records by client endpoint.

use crate::{Backend, DnsBucket, Reconciled};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use service_graph_core::{
    stats::{Combine, GraphDnsResponseCode, GraphDnsStats, GraphLatency},
    Error, FlowEndpoint, Result, TimeRange,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// The DNS statistics for the lookups made by one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DnsLog {
    pub endpoint: FlowEndpoint,
    pub stats: GraphDnsStats,
}

#[instrument(skip(backend, range), fields(range = %range))]
pub async fn dns_logs(
    backend: &dyn Backend,
    cluster: &str,
    range: &TimeRange,
    max_records: usize,
) -> Result<Reconciled<DnsLog>> {
    let mut buckets = backend.dns_logs(cluster, range).await?;
    let mut clients = BTreeMap::<FlowEndpoint, GraphDnsStats>::new();
    let mut truncated = false;
    while let Some(bucket) = buckets.next().await {
        let bucket = match bucket {
            Ok(bucket) => bucket,
            Err(Error::DataTruncated) => {
                warn!("DNS records truncated");
                truncated = true;
                break;
            }
            Err(error) => return Err(error),
        };

        let endpoint = bucket.client.to_endpoint()?;
        if !clients.contains_key(&endpoint) && clients.len() >= max_records {
            warn!(clients = clients.len(), "DNS clients truncated");
            truncated = true;
            break;
        }
        clients
            .entry(endpoint)
            .or_default()
            .combine(&stats(&bucket));
    }

    debug!(clients = clients.len(), "Aggregated DNS logs");
    let flows = clients
        .into_iter()
        .map(|(endpoint, stats)| DnsLog { endpoint, stats })
        .collect();
    Ok(Reconciled { flows, truncated })
}

fn stats(bucket: &DnsBucket) -> GraphDnsStats {
    let latency = GraphLatency {
        mean: bucket.mean_latency,
        max: bucket.max_latency,
        count: bucket.count,
    };
    let code = if bucket.response_code.is_empty() {
        "-".to_string()
    } else {
        bucket.response_code.clone()
    };
    GraphDnsStats {
        latency,
        response_codes: BTreeMap::from([(
            code.clone(),
            GraphDnsResponseCode {
                code,
                count: bucket.count,
                latency,
            },
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawEndpoint;

    #[test]
    fn records_one_response_code() {
        let bucket = DnsBucket {
            client: RawEndpoint {
                kind: "wep".to_string(),
                namespace: "shop".to_string(),
                name_aggr: "web-*".to_string(),
                port: 0,
            },
            response_code: "NXDomain".to_string(),
            count: 4,
            mean_latency: 2.0,
            max_latency: 5.0,
        };
        let mut total = stats(&bucket);
        total.combine(&stats(&DnsBucket {
            response_code: "NoError".to_string(),
            count: 4,
            mean_latency: 4.0,
            max_latency: 4.0,
            ..bucket.clone()
        }));

        assert_eq!(total.latency.count, 8);
        assert_eq!(total.latency.mean, 3.0);
        assert_eq!(total.latency.max, 5.0);
        assert_eq!(total.response_codes.len(), 2);
        assert_eq!(total.response_codes["NXDomain"].count, 4);
    }
}
