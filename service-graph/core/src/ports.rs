use serde::{Deserialize, Serialize};

/// An inclusive range of ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

/// A summary of the ports accessed for a single protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPorts {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_ranges: Vec<PortRange>,
    /// The number of ports in ranges that were not listed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_other_ports: u32,
}

/// A summary of the protocols and ports accessed on an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedProtoPorts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proto_ports: Vec<AggregatedPorts>,
    /// The number of protocols that were not listed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_other_protocols: u32,
}

/// A sorted set of disjoint, non-adjacent port ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRangeSet {
    ranges: Vec<PortRange>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

// === impl PortRange ===

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            min_port: port,
            max_port: port,
        }
    }

    /// The number of ports in the range.
    pub fn num(&self) -> u32 {
        u32::from(self.max_port) - u32::from(self.min_port) + 1
    }

    fn contains(&self, port: u16) -> bool {
        self.min_port <= port && port <= self.max_port
    }
}

// === impl PortRangeSet ===

impl PortRangeSet {
    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds a port, extending or joining neighboring ranges.
    pub fn insert(&mut self, port: u16) {
        // The index of the first range that does not end below the port.
        let i = self.ranges.partition_point(|r| r.max_port < port);

        if let Some(r) = self.ranges.get(i) {
            if r.contains(port) {
                return;
            }
        }

        let joins_prev = i > 0 && self.ranges[i - 1].max_port.checked_add(1) == Some(port);
        let joins_next = self
            .ranges
            .get(i)
            .map(|r| port.checked_add(1) == Some(r.min_port))
            .unwrap_or(false);

        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[i - 1].max_port = self.ranges[i].max_port;
                self.ranges.remove(i);
            }
            (true, false) => self.ranges[i - 1].max_port = port,
            (false, true) => self.ranges[i].min_port = port,
            (false, false) => self.ranges.insert(i, PortRange::single(port)),
        }
    }

    pub fn extend(&mut self, other: &Self) {
        for r in &other.ranges {
            for port in r.min_port..=r.max_port {
                self.insert(port);
            }
        }
    }
}

// === impl AggregatedProtoPorts ===

impl AggregatedProtoPorts {
    /// Summarizes the port sets for each protocol, listing at most `max_protocols` protocols and
    /// `max_ranges` ranges per protocol. Anything beyond the limits is counted.
    pub fn summarize<'a>(
        protocols: impl ExactSizeIterator<Item = (&'a str, Option<&'a PortRangeSet>)>,
        max_protocols: usize,
        max_ranges: usize,
    ) -> Self {
        let total = protocols.len();
        let mut summary = Self::default();
        for (protocol, ports) in protocols {
            if summary.proto_ports.len() >= max_protocols {
                break;
            }
            let mut aggr = AggregatedPorts {
                protocol: protocol.to_string(),
                ..Default::default()
            };
            for range in ports.map(PortRangeSet::ranges).unwrap_or_default() {
                if aggr.port_ranges.len() >= max_ranges {
                    aggr.num_other_ports += range.num();
                } else {
                    aggr.port_ranges.push(*range);
                }
            }
            summary.proto_ports.push(aggr);
        }
        summary.num_other_protocols = (total - summary.proto_ports.len()) as u32;
        summary
    }

    /// Merges another summary into this one.
    ///
    /// Listed ranges for the same protocol are unioned. Counts of unlisted ports and protocols are
    /// summed, so the merged counts are an upper bound.
    pub fn include(&mut self, other: &Self) {
        for ports in &other.proto_ports {
            match self
                .proto_ports
                .iter_mut()
                .find(|p| p.protocol == ports.protocol)
            {
                Some(existing) => existing.include(ports),
                None => self.proto_ports.push(ports.clone()),
            }
        }
        self.proto_ports.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        self.num_other_protocols += other.num_other_protocols;
    }
}

impl AggregatedPorts {
    fn include(&mut self, other: &Self) {
        let mut set = PortRangeSet {
            ranges: std::mem::take(&mut self.port_ranges),
        };
        set.ranges.sort();
        set.extend(&PortRangeSet {
            ranges: other.port_ranges.clone(),
        });
        self.port_ranges = set.ranges;
        self.num_other_ports += other.num_other_ports;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(set: &PortRangeSet) -> Vec<(u16, u16)> {
        set.ranges()
            .iter()
            .map(|r| (r.min_port, r.max_port))
            .collect()
    }

    #[test]
    fn insert_merges_adjacent_ranges() {
        let mut set = PortRangeSet::default();
        for port in [10, 12, 5, 11, 4, 6, 65535, 65534, 1] {
            set.insert(port);
        }
        assert_eq!(ranges(&set), vec![(1, 1), (4, 6), (10, 12), (65534, 65535)]);

        set.insert(11);
        set.insert(2);
        set.insert(3);
        assert_eq!(ranges(&set), vec![(1, 6), (10, 12), (65534, 65535)]);
    }

    #[test]
    fn insert_is_order_independent() {
        let ports = [80u16, 81, 443, 8080, 82, 79, 444, 8081, 1000];
        let mut forward = PortRangeSet::default();
        ports.iter().for_each(|p| forward.insert(*p));
        let mut backward = PortRangeSet::default();
        ports.iter().rev().for_each(|p| backward.insert(*p));
        assert_eq!(forward, backward);
        assert_eq!(
            ranges(&forward),
            vec![(79, 82), (443, 444), (1000, 1000), (8080, 8081)]
        );
    }

    #[test]
    fn summary_respects_caps_and_counts_overflow() {
        let mut sets = Vec::new();
        for proto in 0..12u16 {
            let mut set = PortRangeSet::default();
            // Seven single-port ranges per protocol.
            for i in 0..7 {
                set.insert(proto * 100 + i * 2);
            }
            sets.push((format!("p{proto:02}"), set));
        }

        let summary = AggregatedProtoPorts::summarize(
            sets.iter().map(|(p, s)| (p.as_str(), Some(s))),
            10,
            5,
        );
        assert_eq!(summary.proto_ports.len(), 10);
        assert_eq!(summary.num_other_protocols, 2);
        for ports in &summary.proto_ports {
            assert_eq!(ports.port_ranges.len(), 5);
            assert_eq!(ports.num_other_ports, 2);
            let listed: u32 = ports.port_ranges.iter().map(PortRange::num).sum();
            assert_eq!(listed + ports.num_other_ports, 7);
        }
    }

    #[test]
    fn include_unions_ranges_per_protocol() {
        let single = |proto: &str, port| AggregatedProtoPorts {
            proto_ports: vec![AggregatedPorts {
                protocol: proto.to_string(),
                port_ranges: vec![PortRange::single(port)],
                num_other_ports: 0,
            }],
            num_other_protocols: 0,
        };
        let mut ports = single("tcp", 80);
        ports.include(&single("tcp", 81));
        ports.include(&single("udp", 53));
        ports.include(&single("tcp", 80));
        assert_eq!(
            ports.proto_ports,
            vec![
                AggregatedPorts {
                    protocol: "tcp".to_string(),
                    port_ranges: vec![PortRange {
                        min_port: 80,
                        max_port: 81
                    }],
                    num_other_ports: 0,
                },
                AggregatedPorts {
                    protocol: "udp".to_string(),
                    port_ranges: vec![PortRange::single(53)],
                    num_other_ports: 0,
                },
            ]
        );
    }
}
