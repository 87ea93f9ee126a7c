//! Proxy-facing state shared across a sync cycle

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::haproxy::HaproxyRules;
use crate::route::{IngressRoutes, Route};

#[derive(Debug, Default)]
pub struct Configuration {
    pub ingress_routes: IngressRoutes,
    /// Certificate files referenced during the current cycle
    pub used_certs: BTreeSet<PathBuf>,
    /// TLS offload is enabled on the HTTPS frontend
    pub https: bool,
    /// Some route asked for TLS passthrough during the current cycle
    pub ssl_passthrough: bool,
    pub haproxy_rules: HaproxyRules,
}

impl Configuration {
    /// Drop per-cycle caches after a successful commit and return the routes
    /// collected during the cycle. `https` is kept: it is the last applied state.
    pub fn clean(&mut self) -> Vec<Route> {
        self.haproxy_rules.clean();
        self.ssl_passthrough = false;
        self.ingress_routes.take()
    }
}
