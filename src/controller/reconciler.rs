//! Sync cycle: declarative state in, committed proxy configuration out
//!
//! Every cycle runs inside one transaction. Nothing reaches the live proxy
//! unless the commit succeeds, and the store keeps its change markers until
//! then, so a failed cycle is simply retried on the next event.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use super::annotations::{get_bool_value, handle_global_annotations};
use super::binds::{bind_list, reconcile_frontend_binds, BindSettings};
use super::certs::handle_tls_secret;
use super::configuration::Configuration;
use super::handler::UpdateHandler;
use super::https::Https;
use super::ingress::handle_ingress_annotations;
use super::proxy_protocol::ProxyProtocol;
use super::service::{ServiceAction, ServiceControl};
use crate::config::{ControllerConfig, DEFAULT_HTTPS_PORT};
use crate::error::{Error, Result};
use crate::haproxy::{HaproxyClient, HaproxyRules, FRONTEND_HTTP, FRONTEND_HTTPS};
use crate::route::Route;
use crate::store::{
    get_value_from_annotations, Ingress, IngressPath, Namespace, ServicePort, Status, Store,
};

pub const ANN_DEFAULT_BACKEND_SERVICE: &str = "default-backend-service";
pub const ANN_SSL_PASSTHROUGH: &str = "ssl-passthrough";
/// Ingress name of the route registered for the default backend service
pub const DEFAULT_SERVICE_INGRESS: &str = "DefaultService";

/// What the proxy was asked to do after a committed cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    None,
    Reload,
    Restart,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub action: Action,
    /// Routes collected during the cycle, in discovery order
    pub routes: Vec<Route>,
    /// Frontend rules built during the cycle
    pub rules: HaproxyRules,
}

/// Settings the engine needs from the operator configuration
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub default_backend_service: Option<String>,
    pub cert_dir: PathBuf,
    pub binds: BindSettings,
    /// `None` when the entry point is disabled
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
}

impl ControllerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            default_backend_service: config.default_backend_service.clone(),
            cert_dir: config.paths().cert_dir,
            binds: config.bind_settings(),
            http_port: (!config.disable_http).then_some(config.http_bind_port),
            https_port: (!config.disable_https).then_some(config.https_bind_port),
        }
    }
}

/// Handlers run after the ingress walk, in this order
pub fn default_handlers(settings: &ControllerSettings) -> Vec<Box<dyn UpdateHandler>> {
    vec![
        Box::new(Https {
            enabled: settings.https_port.is_some(),
            binds: settings.binds.clone(),
            port: settings.https_port.unwrap_or(DEFAULT_HTTPS_PORT),
            cert_dir: settings.cert_dir.clone(),
        }),
        Box::new(ProxyProtocol),
    ]
}

pub struct Controller<C: HaproxyClient> {
    store: Store,
    cfg: Configuration,
    client: C,
    service: Arc<dyn ServiceControl>,
    update_handlers: Vec<Box<dyn UpdateHandler>>,
    settings: ControllerSettings,
}

impl<C: HaproxyClient> Controller<C> {
    pub fn new(
        store: Store,
        client: C,
        service: Arc<dyn ServiceControl>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            cfg: Configuration::default(),
            client,
            service,
            update_handlers: Vec::new(),
            settings,
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn UpdateHandler>) {
        debug!("Registering update handler {}", handler.name());
        self.update_handlers.push(handler);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn configuration(&self) -> &Configuration {
        &self.cfg
    }

    /// Align the listeners of the HTTP and HTTPS frontends with the enabled
    /// address families and ports. Run once at startup.
    pub fn handle_binds(&mut self) -> Result<()> {
        self.client
            .start_transaction()
            .map_err(Error::TransactionError)?;
        let result = self.reconcile_binds();
        let result = result.and_then(|()| {
            self.client
                .commit_transaction()
                .map_err(Error::TransactionError)
        });
        self.client.dispose_transaction();
        result
    }

    fn reconcile_binds(&mut self) -> Result<()> {
        for (frontend, port) in [
            (FRONTEND_HTTP, self.settings.http_port),
            (FRONTEND_HTTPS, self.settings.https_port),
        ] {
            let Some(port) = port else {
                debug!("Frontend {} disabled, keeping its binds", frontend);
                continue;
            };
            let binds = bind_list(&self.settings.binds, port, false);
            if reconcile_frontend_binds(&mut self.client, frontend, &binds)? {
                info!("Frontend {} now listens on port {}", frontend, port);
            }
        }
        Ok(())
    }

    /// Run one sync cycle
    #[instrument(skip(self))]
    pub async fn update_haproxy(&mut self) -> Result<SyncReport> {
        debug!("HAProxy config sync started");
        if let Err(e) = self.client.start_transaction() {
            error!("Failed to start transaction: {}", e);
            return Err(Error::TransactionError(e));
        }

        let https = self.cfg.https;
        let result = self.sync_transaction().and_then(|changes| {
            self.client
                .commit_transaction()
                .map_err(Error::TransactionError)?;
            Ok(changes)
        });
        self.client.dispose_transaction();
        let (restart, reload) = match result {
            Ok(changes) => changes,
            Err(e) => {
                error!("Sync cycle aborted: {}", e);
                // store markers stay so the next cycle retries the same delta
                self.cfg.clean();
                self.cfg.https = https;
                return Err(e);
            }
        };

        let rules = std::mem::take(&mut self.cfg.haproxy_rules);
        let routes = self.clean();
        let action = if restart {
            Action::Restart
        } else if reload {
            Action::Reload
        } else {
            Action::None
        };
        let service = Arc::clone(&self.service);
        match action {
            Action::Restart => control(service.as_ref(), ServiceAction::Restart).await,
            Action::Reload => control(service.as_ref(), ServiceAction::Reload).await,
            Action::None => {}
        }

        debug!("HAProxy config sync terminated with {} routes", routes.len());
        Ok(SyncReport {
            action,
            routes,
            rules,
        })
    }

    /// Everything between start and commit. Returns `(restart, reload)`.
    fn sync_transaction(&mut self) -> Result<(bool, bool)> {
        let global = handle_global_annotations(&self.store, &mut self.client);
        let restart = global.restart;
        let mut reload = global.reload;

        self.handle_default_service();

        self.cfg.used_certs.clear();
        reload |= self.walk_ingresses();

        for handler in &self.update_handlers {
            let outcome = handler.update(&self.store, &mut self.cfg, &mut self.client);
            for e in &outcome.errors {
                error!("Handler {}: {}", handler.name(), e);
            }
            reload |= outcome.reload;
        }

        if self.client.routing_write(
            self.cfg.ingress_routes.routes(),
            &self.cfg.haproxy_rules,
        )? {
            debug!("Routes or frontend rules changed");
            reload = true;
        }
        Ok((restart, reload))
    }

    fn walk_ingresses(&mut self) -> bool {
        let mut reload = false;
        let store = &self.store;
        let cfg = &mut self.cfg;

        for namespace in store.namespaces.values().filter(|ns| ns.relevant) {
            for ingress in namespace.ingresses.values().filter(|i| i.status != Status::Deleted) {
                if let Some(path) = &ingress.default_backend {
                    cfg.ingress_routes.add_route(Route {
                        namespace: namespace.name.clone(),
                        ingress: ingress.name.clone(),
                        path: path.clone(),
                        ..Default::default()
                    });
                }
                for rule in &ingress.rules {
                    for path in &rule.paths {
                        let passthrough = ssl_passthrough_enabled(store, namespace, ingress, path);
                        cfg.ssl_passthrough |= passthrough;
                        cfg.ingress_routes.add_route(Route {
                            namespace: namespace.name.clone(),
                            ingress: ingress.name.clone(),
                            host: Some(rule.host.clone()),
                            path: path.clone(),
                            backend_name: None,
                            ssl_passthrough: passthrough,
                        });
                    }
                }

                // keyed by secret name, so each secret is handled once
                for tls in ingress.tls.values() {
                    reload |= handle_tls_secret(
                        store,
                        ingress,
                        tls,
                        &self.settings.cert_dir,
                        &mut cfg.used_certs,
                    );
                }

                if ingress.rules.is_empty() {
                    debug!(
                        "Ingress {}/{}: no rules defined",
                        ingress.namespace, ingress.name
                    );
                    continue;
                }
                handle_ingress_annotations(store, ingress, &mut cfg.haproxy_rules);
            }
        }
        reload
    }

    /// Route unmatched traffic to the `namespace/service` named by
    /// `default-backend-service`, when it resolves.
    fn handle_default_service(&mut self) {
        match self.default_service_route() {
            Ok(Some(route)) => self.cfg.ingress_routes.add_route(route),
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    fn default_service_route(&self) -> Result<Option<Route>> {
        let configured = get_value_from_annotations(
            ANN_DEFAULT_BACKEND_SERVICE,
            &[self.store.global_annotations()],
        )
        .filter(|value| !value.is_deleted())
        .map(|value| value.value.as_str())
        .or(self.settings.default_backend_service.as_deref());
        let Some(value) = configured else {
            return Ok(None);
        };

        let parts: Vec<&str> = value.split('/').collect();
        let [namespace, service] = parts.as_slice() else {
            return Err(Error::DefaultBackendError(format!(
                "invalid value '{}', expected namespace/service",
                value
            )));
        };
        if namespace.is_empty() || service.is_empty() {
            return Ok(None);
        }

        let ns = self
            .store
            .namespaces
            .get(*namespace)
            .filter(|ns| ns.relevant)
            .ok_or_else(|| {
                Error::DefaultBackendError(format!("invalid namespace '{}'", namespace))
            })?;
        let svc = ns
            .services
            .get(*service)
            .filter(|s| s.status != Status::Deleted)
            .ok_or_else(|| {
                Error::DefaultBackendError(format!(
                    "service '{}/{}' does not exist",
                    namespace, service
                ))
            })?;
        let port = svc.ports.first().ok_or_else(|| {
            Error::DefaultBackendError(format!(
                "service '{}/{}' has no ports",
                namespace, service
            ))
        })?;

        Ok(Some(Route {
            namespace: ns.name.clone(),
            ingress: DEFAULT_SERVICE_INGRESS.to_string(),
            host: None,
            path: IngressPath {
                service_name: svc.name.clone(),
                service_port: ServicePort::Number(port.port),
                is_default_backend: true,
                ..Default::default()
            },
            backend_name: None,
            ssl_passthrough: false,
        }))
    }

    /// Forget change markers and per-cycle caches once a commit went through
    fn clean(&mut self) -> Vec<Route> {
        self.store.clean();
        self.cfg.clean()
    }
}

/// Failures are logged only: the configuration is already committed
async fn control(service: &dyn ServiceControl, action: ServiceAction) {
    match service.control(action).await {
        Ok(()) => info!("HAProxy {}ed", action),
        Err(e) => error!("HAProxy {} failed: {}", action, e),
    }
}

/// Resolve `ssl-passthrough` for one ingress path. Service annotations only
/// take part when the path's service exists in the namespace.
pub fn ssl_passthrough_enabled(
    store: &Store,
    namespace: &Namespace,
    ingress: &Ingress,
    path: &IngressPath,
) -> bool {
    let global = store.global_annotations();
    let value = match namespace.services.get(&path.service_name) {
        Some(service) => get_value_from_annotations(
            ANN_SSL_PASSTHROUGH,
            &[&service.annotations, &ingress.annotations, global],
        ),
        None => get_value_from_annotations(ANN_SSL_PASSTHROUGH, &[&ingress.annotations, global]),
    };
    let Some(value) = value else {
        return false;
    };
    if value.is_deleted() {
        return false;
    }
    match get_bool_value(&value.value, ANN_SSL_PASSTHROUGH) {
        Ok(enabled) => enabled,
        Err(e) => {
            error!("Ingress {}/{}: {}", ingress.namespace, ingress.name, e);
            false
        }
    }
}
