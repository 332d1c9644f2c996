use super::*;
use crate::{
    events::RawEvent, Buckets, DnsBucket, FlowConfig, L7Bucket, LogStats, ProcessStats,
    RawEndpoint, RawService, TcpStats,
};
use chrono::{TimeZone, Utc};
use service_graph_core::EndpointType;
use std::num::NonZeroU16;

fn wep(namespace: &str, name_aggr: &str, port: u16) -> RawEndpoint {
    RawEndpoint {
        kind: "wep".to_string(),
        namespace: namespace.to_string(),
        name_aggr: name_aggr.to_string(),
        port,
    }
}

fn packets(packets: i64, bytes: i64) -> GraphPacketStats {
    GraphPacketStats {
        packets_in: packets,
        packets_out: 0,
        bytes_in: bytes,
        bytes_out: 0,
    }
}

fn bucket(reporter: Reporter, action: Action, traffic: GraphPacketStats) -> L3Bucket {
    L3Bucket {
        source: wep("shop", "web-*", 0),
        dest: wep("shop", "cart-*", 8080),
        protocol: "tcp".to_string(),
        reporter,
        action,
        service: None,
        process: None,
        log_stats: Some(LogStats {
            log_count: 3,
            flow_log_count: 2,
            started: 1,
            completed: 1,
        }),
        traffic: Some(traffic),
        tcp: None,
        process_stats: None,
    }
}

fn with_service(mut bucket: L3Bucket) -> L3Bucket {
    bucket.service = Some(RawService {
        namespace: "shop".to_string(),
        name: "cart".to_string(),
        port_name: "http".to_string(),
        port: 80,
    });
    bucket
}

fn cart_service() -> ServicePort {
    ServicePort {
        namespace: "shop".to_string(),
        name: "cart".to_string(),
        port_name: "http".to_string(),
        port: 80,
        protocol: "tcp".to_string(),
    }
}

fn reconcile(buckets: &[L3Bucket]) -> Vec<L3Flow> {
    let mut reconciler = L3Reconciler::new(1000);
    for b in buckets {
        reconciler.add(b).expect("bucket must be accepted");
    }
    // A window of one flush interval leaves connection counts as they are.
    reconciler
        .finish(Duration::from_secs(300), Duration::from_secs(300))
        .flows
}

#[test]
fn splits_source_traffic_by_destination_verdict() {
    let flows = reconcile(&[
        with_service(bucket(Reporter::Src, Action::Allow, packets(10, 1000))),
        bucket(Reporter::Dst, Action::Allow, packets(6, 300)),
        bucket(Reporter::Dst, Action::Deny, packets(2, 100)),
    ]);

    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.edge.service_port, Some(cart_service()));
    assert_eq!(
        flow.edge.dest,
        FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*")
            .with_port("tcp", NonZeroU16::new(8080))
    );

    let allowed = flow.stats.allowed.expect("some traffic is allowed");
    let denied = flow.stats.denied_at_dest.expect("some traffic is denied");
    assert_eq!(allowed, packets(7, 750));
    assert_eq!(denied, packets(3, 250));

    // Nothing is counted twice.
    let mut total = allowed;
    total.combine(&denied);
    assert_eq!(total, packets(10, 1000));
    assert_eq!(flow.stats.denied_at_source, None);
}

#[test]
fn destination_without_verdict_allows_source_traffic() {
    let flows = reconcile(&[
        with_service(bucket(Reporter::Src, Action::Allow, packets(10, 1000))),
        with_service(bucket(Reporter::Src, Action::Deny, packets(1, 50))),
        bucket(Reporter::Dst, Action::Allow, packets(8, 900)),
    ]);

    assert_eq!(flows.len(), 1);
    let stats = &flows[0].stats;
    assert_eq!(stats.allowed, Some(packets(10, 1000)));
    assert_eq!(stats.denied_at_dest, None);
    assert_eq!(stats.denied_at_source, Some(packets(1, 50)));
    assert_eq!(stats.connections.total_per_sample_interval, 6);
}

#[test]
fn destination_denying_everything_denies_source_traffic() {
    let flows = reconcile(&[
        with_service(bucket(Reporter::Src, Action::Allow, packets(10, 1000))),
        bucket(Reporter::Dst, Action::Deny, packets(10, 1000)),
    ]);

    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].stats.allowed, None);
    assert_eq!(flows[0].stats.denied_at_dest, Some(packets(10, 1000)));
}

#[test]
fn single_sided_reports_pass_through() {
    let flows = reconcile(&[
        with_service(bucket(Reporter::Src, Action::Allow, packets(4, 400))),
        with_service(bucket(Reporter::Src, Action::Deny, packets(1, 100))),
    ]);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].stats.allowed, Some(packets(4, 400)));
    assert_eq!(flows[0].stats.denied_at_source, Some(packets(1, 100)));
    assert_eq!(flows[0].stats.denied_at_dest, None);

    let mut dest_only = bucket(Reporter::Dst, Action::Deny, packets(2, 200));
    dest_only.source = RawEndpoint {
        kind: "net".to_string(),
        namespace: "-".to_string(),
        name_aggr: "pub".to_string(),
        port: 0,
    };
    let flows = reconcile(&[dest_only]);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].edge.service_port, None);
    assert_eq!(flows[0].stats.denied_at_dest, Some(packets(2, 200)));
    assert_eq!(flows[0].stats.allowed, None);
    assert_eq!(flows[0].stats.denied_at_source, None);
    assert_eq!(
        flows[0].edge.source,
        FlowEndpoint::new(EndpointType::Network, "", "pub")
    );
}

#[test]
fn unserviced_ports_are_summarized() {
    let mut buckets = Vec::new();
    for proto in 0..12u16 {
        for i in 0..7u16 {
            let mut b = bucket(Reporter::Src, Action::Allow, packets(1, 10));
            b.protocol = format!("p{proto:02}");
            b.dest.port = 1000 + proto * 100 + i * 2;
            buckets.push(b);
        }
    }
    let flows = reconcile(&buckets);

    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(
        flow.edge.dest,
        FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*")
    );
    assert_eq!(flow.edge.service_port, None);
    assert_eq!(flow.stats.allowed, Some(packets(84, 840)));

    let ports = flow
        .aggregated_proto_ports
        .as_ref()
        .expect("ports must be summarized");
    assert_eq!(ports.proto_ports.len(), 10);
    assert_eq!(ports.num_other_protocols, 2);
    assert!(ports
        .proto_ports
        .iter()
        .all(|p| p.port_ranges.len() == 5 && p.num_other_ports == 2));
}

#[test]
fn zero_tcp_stats_carry_no_weight() {
    let mut empty = bucket(Reporter::Src, Action::Allow, packets(1, 10));
    empty.tcp = Some(TcpStats::default());
    let mut real = bucket(Reporter::Src, Action::Allow, packets(1, 10));
    real.tcp = Some(TcpStats {
        mean_smooth_rtt: 10.0,
        max_smooth_rtt: 20.0,
        ..Default::default()
    });
    real.process = Some("curl".to_string());
    real.process_stats = Some(ProcessStats {
        min_num_names_per_flow: 1,
        max_num_names_per_flow: 1,
        min_num_ids_per_flow: 1,
        max_num_ids_per_flow: 3,
    });

    let flows = reconcile(&[empty, real]);
    assert_eq!(flows.len(), 1);
    let tcp = flows[0].stats.tcp.expect("tcp stats must be present");
    assert_eq!(tcp.count, 2);
    assert_eq!(tcp.mean_smooth_rtt, 10.0);

    let processes = flows[0].processes.as_ref().expect("processes must be set");
    assert!(processes.dest.is_empty());
    let curl = &processes.source["web-*:cart-*:curl"];
    assert_eq!(curl.name, "curl");
    assert_eq!(curl.max_num_ids_per_flow, 3);
    assert_eq!(processes.source["web-*:cart-*:"].name, "-");
}

#[test]
fn connections_are_scaled_to_the_flush_interval() {
    let mut reconciler = L3Reconciler::new(1000);
    reconciler
        .add(&bucket(Reporter::Src, Action::Allow, packets(1, 1)))
        .expect("bucket must be accepted");
    let flows = reconciler
        .finish(Duration::from_secs(900), Duration::from_secs(300))
        .flows;
    assert_eq!(flows[0].stats.connections.total_per_sample_interval, 1);
    assert_eq!(flows[0].stats.connections.started, 1);
}

#[test]
fn unknown_endpoint_types_are_internal_errors() {
    let mut b = bucket(Reporter::Src, Action::Allow, packets(1, 1));
    b.source.kind = "pod".to_string();
    let mut reconciler = L3Reconciler::new(1000);
    assert!(matches!(reconciler.add(&b), Err(Error::Internal(_))));
}

struct Flows(Vec<Result<L3Bucket>>);

#[async_trait::async_trait]
impl Backend for Flows {
    async fn flow_config(&self, _: &str) -> Result<FlowConfig> {
        Ok(FlowConfig {
            l3_flush_interval: Duration::from_secs(300),
            l7_flush_interval: Duration::from_secs(300),
            dns_flush_interval: Duration::from_secs(300),
        })
    }

    async fn l3_flows(&self, _: &str, _: &TimeRange) -> Result<Buckets<L3Bucket>> {
        Ok(stream::iter(self.0.clone()).boxed())
    }

    async fn l7_flows(&self, _: &str, _: &TimeRange) -> Result<Buckets<L7Bucket>> {
        Ok(stream::empty().boxed())
    }

    async fn dns_logs(&self, _: &str, _: &TimeRange) -> Result<Buckets<DnsBucket>> {
        Ok(stream::empty().boxed())
    }

    async fn events(&self, _: &str, _: &TimeRange) -> Result<Vec<RawEvent>> {
        Ok(Vec::new())
    }
}

fn range() -> TimeRange {
    TimeRange {
        from: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
        to: Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap(),
        now: None,
    }
}

fn to_service(n: u16) -> Result<L3Bucket> {
    let mut b = bucket(Reporter::Src, Action::Allow, packets(1, 1));
    b.dest = wep("shop", &format!("svc{n}-*"), 80);
    Ok(b)
}

#[tokio::test]
async fn stops_reading_past_the_record_limit() {
    let _trace = tracing::subscriber::set_default(tracing_subscriber::fmt().finish());

    let backend = Flows((0..10).map(to_service).collect());
    let out = l3_flows(&backend, "cluster", &range(), Duration::from_secs(300), 2)
        .await
        .expect("truncation is not an error");
    assert!(out.truncated);
    assert_eq!(out.flows.len(), 2);
}

#[test]
fn record_limit_is_inclusive() {
    let window = Duration::from_secs(300);

    let mut reconciler = L3Reconciler::new(2);
    for b in (0..2).map(to_service) {
        reconciler
            .add(&b.expect("bucket"))
            .expect("bucket must be accepted");
    }
    let out = reconciler.finish(window, window);
    assert!(!out.truncated);
    assert_eq!(out.flows.len(), 2);

    // The last destination group only spills over when it is flushed.
    let mut reconciler = L3Reconciler::new(2);
    for b in (0..3).map(to_service) {
        reconciler
            .add(&b.expect("bucket"))
            .expect("bucket must be accepted");
    }
    let out = reconciler.finish(window, window);
    assert!(out.truncated);
    assert_eq!(out.flows.len(), 2);
}

#[tokio::test]
async fn store_truncation_keeps_partial_flows() {
    let mut buckets: Vec<_> = (0..3).map(to_service).collect();
    buckets.push(Err(Error::DataTruncated));
    buckets.push(to_service(7));
    let out = l3_flows(&Flows(buckets), "cluster", &range(), Duration::from_secs(300), 100)
        .await
        .expect("truncation is not an error");
    assert!(out.truncated);
    assert_eq!(out.flows.len(), 3);

    let failing = Flows(vec![
        to_service(1),
        Err(Error::Backend("connection reset".to_string())),
    ]);
    let err = l3_flows(&failing, "cluster", &range(), Duration::from_secs(300), 100)
        .await
        .expect_err("backend errors must fail the query");
    assert_eq!(err, Error::Backend("connection reset".to_string()));
}
