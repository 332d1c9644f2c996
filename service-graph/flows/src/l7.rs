//! Aggregates HTTP log records into one flow per source, destination and service.

use crate::{Backend, L7Bucket, Reconciled};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use service_graph_core::{
    stats::{Combine, GraphL7PacketStats, GraphL7Stats},
    Error, FlowEdge, Result, TimeRange,
};
use tracing::{debug, instrument, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct L7Flow {
    pub edge: FlowEdge,
    pub stats: GraphL7Stats,
}

#[derive(Debug)]
pub struct L7Reconciler {
    flows: Vec<L7Flow>,
    index: HashMap<FlowEdge, usize>,
    max_records: usize,
}

#[instrument(skip(backend, range), fields(range = %range))]
pub async fn l7_flows(
    backend: &dyn Backend,
    cluster: &str,
    range: &TimeRange,
    max_records: usize,
) -> Result<Reconciled<L7Flow>> {
    let mut buckets = backend.l7_flows(cluster, range).await?;
    let mut reconciler = L7Reconciler::new(max_records);
    let mut truncated = false;
    while let Some(bucket) = buckets.next().await {
        match bucket.and_then(|b| reconciler.add(&b)) {
            Ok(()) => {}
            Err(Error::DataTruncated) => {
                warn!("HTTP records truncated");
                truncated = true;
                break;
            }
            Err(error) => return Err(error),
        }
    }

    let flows = reconciler.finish();
    debug!(flows = flows.len(), "Aggregated HTTP flows");
    Ok(Reconciled { flows, truncated })
}

impl L7Reconciler {
    pub fn new(max_records: usize) -> Self {
        Self {
            flows: Vec::new(),
            index: HashMap::new(),
            max_records,
        }
    }

    pub fn add(&mut self, bucket: &L7Bucket) -> Result<()> {
        let edge = FlowEdge {
            source: bucket.source.to_endpoint()?,
            dest: bucket.dest.to_endpoint()?,
            service_port: bucket
                .service
                .as_ref()
                .and_then(|svc| svc.to_service_port("tcp")),
        };

        let mut stats = GraphL7Stats::default();
        let code = bucket.response_code.trim().parse::<u16>().unwrap_or(0);
        *stats.bucket_mut(code) = GraphL7PacketStats {
            bytes_in: bucket.bytes_in,
            bytes_out: bucket.bytes_out,
            mean_duration: bucket.mean_duration,
            min_duration: bucket.min_duration,
            max_duration: bucket.max_duration,
            count: bucket.count,
        };

        if let Some(&i) = self.index.get(&edge) {
            self.flows[i].stats.combine(&stats);
            return Ok(());
        }
        if self.flows.len() >= self.max_records {
            return Err(Error::DataTruncated);
        }
        self.index.insert(edge.clone(), self.flows.len());
        self.flows.push(L7Flow { edge, stats });
        Ok(())
    }

    pub fn finish(self) -> Vec<L7Flow> {
        self.flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawEndpoint, RawService};
    use service_graph_core::{EndpointType, FlowEndpoint, ServicePort};

    fn record(code: &str, count: i64, mean: f64, min: f64, max: f64) -> L7Bucket {
        L7Bucket {
            source: RawEndpoint {
                kind: "wep".to_string(),
                namespace: "shop".to_string(),
                name_aggr: "web-*".to_string(),
                port: 0,
            },
            dest: RawEndpoint {
                kind: "wep".to_string(),
                namespace: "shop".to_string(),
                name_aggr: "cart-*".to_string(),
                port: 8080,
            },
            service: Some(RawService {
                namespace: "shop".to_string(),
                name: "cart".to_string(),
                port_name: "http".to_string(),
                port: 80,
            }),
            response_code: code.to_string(),
            bytes_in: 100 * count,
            bytes_out: 10 * count,
            count,
            mean_duration: mean,
            min_duration: min,
            max_duration: max,
        }
    }

    #[test]
    fn buckets_response_codes_by_class() {
        let mut reconciler = L7Reconciler::new(10);
        for b in [
            record("200", 2, 10.0, 5.0, 15.0),
            record("204", 6, 30.0, 1.0, 50.0),
            record("503", 1, 100.0, 100.0, 100.0),
            record("", 1, 0.0, 0.0, 0.0),
            record("999", 1, 0.0, 0.0, 0.0),
        ] {
            reconciler.add(&b).expect("record must be accepted");
        }
        let flows = reconciler.finish();

        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(
            flow.edge.service_port,
            Some(ServicePort {
                namespace: "shop".to_string(),
                name: "cart".to_string(),
                port_name: "http".to_string(),
                port: 80,
                protocol: "tcp".to_string(),
            })
        );
        assert_eq!(
            flow.edge.dest,
            FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*")
        );

        let ok = flow.stats.response_code_2xx;
        assert_eq!(ok.count, 8);
        assert_eq!(ok.bytes_in, 800);
        assert_eq!(ok.mean_duration, 25.0);
        assert_eq!(ok.min_duration, 1.0);
        assert_eq!(ok.max_duration, 50.0);
        assert_eq!(flow.stats.response_code_5xx.count, 1);
        assert_eq!(flow.stats.no_response.count, 2);
        assert!(flow.stats.response_code_4xx.is_empty());
    }

    #[test]
    fn unserviced_records_are_separate_flows() {
        let mut reconciler = L7Reconciler::new(10);
        let mut unserviced = record("200", 1, 1.0, 1.0, 1.0);
        unserviced.service = Some(RawService {
            name: "-".to_string(),
            ..Default::default()
        });
        reconciler
            .add(&record("200", 1, 1.0, 1.0, 1.0))
            .expect("record must be accepted");
        reconciler.add(&unserviced).expect("record must be accepted");

        let flows = reconciler.finish();
        assert_eq!(flows.len(), 2);
        assert!(flows[0].edge.service_port.is_some());
        assert!(flows[1].edge.service_port.is_none());
    }

    #[test]
    fn too_many_flows_are_truncated() {
        let mut reconciler = L7Reconciler::new(1);
        reconciler
            .add(&record("200", 1, 1.0, 1.0, 1.0))
            .expect("record must be accepted");
        // Records for a known flow are still merged.
        reconciler
            .add(&record("404", 1, 1.0, 1.0, 1.0))
            .expect("record must be accepted");

        let mut other = record("200", 1, 1.0, 1.0, 1.0);
        other.dest.name_aggr = "pay-*".to_string();
        assert_eq!(reconciler.add(&other), Err(Error::DataTruncated));
        assert_eq!(reconciler.finish().len(), 1);
    }

    #[test]
    fn record_limit_is_inclusive() {
        let mut reconciler = L7Reconciler::new(2);
        for name in ["cart-*", "pay-*"] {
            let mut r = record("200", 1, 1.0, 1.0, 1.0);
            r.dest.name_aggr = name.to_string();
            reconciler.add(&r).expect("record must be accepted");
        }
        let mut third = record("200", 1, 1.0, 1.0, 1.0);
        third.dest.name_aggr = "ship-*".to_string();
        assert_eq!(reconciler.add(&third), Err(Error::DataTruncated));
        assert_eq!(reconciler.finish().len(), 2);
    }
}
