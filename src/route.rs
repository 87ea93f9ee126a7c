//! Routes discovered while walking the declarative state
//!
//! A route is a plain value: it is built during a sync cycle, handed to the
//! route compiler, and discarded. Order of discovery is preserved.

use serde::{Deserialize, Serialize};

use crate::store::IngressPath;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub namespace: String,
    pub ingress: String,
    pub host: Option<String>,
    pub path: IngressPath,
    /// Literal backend name, for routes that do not target a service
    pub backend_name: Option<String>,
    pub ssl_passthrough: bool,
}

#[derive(Clone, Debug, Default)]
pub struct IngressRoutes {
    routes: Vec<Route>,
}

impl IngressRoutes {
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Whether any collected route asks for TLS passthrough
    pub fn passthrough_requested(&self) -> bool {
        self.routes.iter().any(|r| r.ssl_passthrough)
    }

    /// Hand the collected routes over, leaving the collector empty
    pub fn take(&mut self) -> Vec<Route> {
        std::mem::take(&mut self.routes)
    }
}
