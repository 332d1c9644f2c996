use crate::{JsonClient, NewAuthorizer};
use service_graph_cache::Authorizer;
use service_graph_core::Result;
use service_graph_index::{Labels, Permission};
use std::collections::BTreeMap;

/// Builds an [`Authorizer`] for each request, forwarding the caller's bearer token to the
/// authorization service.
#[derive(Clone, Debug)]
pub struct AuthzClient {
    client: JsonClient,
}

#[derive(Clone, Debug)]
pub struct UserAuthorizer {
    client: JsonClient,
    token: Option<String>,
}

// === impl AuthzClient ===

impl AuthzClient {
    pub fn new(client: JsonClient) -> Self {
        Self { client }
    }
}

impl NewAuthorizer for AuthzClient {
    type Authorizer = UserAuthorizer;

    fn new_authorizer(&self, token: Option<&str>) -> UserAuthorizer {
        UserAuthorizer {
            client: self.client.clone(),
            token: token.map(Into::into),
        }
    }
}

// === impl UserAuthorizer ===

#[async_trait::async_trait]
impl Authorizer for UserAuthorizer {
    async fn authorization_review(&self, cluster: &str) -> Result<Vec<Permission>> {
        self.client
            .post(
                &format!("/clusters/{cluster}/authorization-review"),
                self.token.as_deref(),
                &(),
            )
            .await
    }

    async fn host_labels(&self, cluster: &str) -> Result<BTreeMap<String, Labels>> {
        self.client
            .post(
                &format!("/clusters/{cluster}/hosts"),
                self.token.as_deref(),
                &(),
            )
            .await
    }
}
