use crate::{FlowEndpoint, GraphNodeId, NamespacedName, ServicePort};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    sync::Arc,
};

/// A maximal set of services that share endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceGroup {
    /// Derived from the sorted member services, so it does not depend on discovery order.
    pub id: GraphNodeId,

    /// The common namespace of the members, or `*`.
    pub namespace: String,

    /// The common name of the members, or `*`.
    pub name: String,

    /// Member services sorted by namespace and name.
    pub services: Vec<NamespacedName>,

    /// The endpoints observed behind each service port.
    pub service_ports: BTreeMap<ServicePort, BTreeSet<FlowEndpoint>>,
}

/// Resolves the service group for a service or an endpoint.
pub trait ServiceGroupLookup {
    fn by_service(&self, service: &NamespacedName) -> Option<Arc<ServiceGroup>>;

    fn by_endpoint(&self, endpoint: &FlowEndpoint) -> Option<Arc<ServiceGroup>>;
}

// === impl ServiceGroup ===

impl ServiceGroup {
    /// Builds the group ID from services already sorted by namespace and name.
    pub fn id_for(services: &[NamespacedName]) -> GraphNodeId {
        let mut id = String::from("svcgp");
        for svc in services {
            let _ = write!(id, ";svc/{}/{}", svc.namespace, svc.name);
        }
        GraphNodeId::from(id)
    }

    pub fn contains(&self, service: &NamespacedName) -> bool {
        self.services.binary_search(service).is_ok()
    }
}

/// A lookup with no groups.
impl ServiceGroupLookup for () {
    fn by_service(&self, _: &NamespacedName) -> Option<Arc<ServiceGroup>> {
        None
    }

    fn by_endpoint(&self, _: &FlowEndpoint) -> Option<Arc<ServiceGroup>> {
        None
    }
}
