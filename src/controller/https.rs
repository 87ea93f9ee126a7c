//! SSL offload and SSL passthrough topology
//!
//! Offload is wanted as soon as one certificate is in use. Passthrough is
//! wanted when at least one route asks for it; it is implemented by putting a
//! TCP frontend (`ssl`) on the public HTTPS addresses that inspects SNI and
//! chains everything it does not pass through to the HTTPS frontend, which
//! then listens on loopback with the PROXY protocol.
//!
//! The passthrough state is read back from the proxy every cycle rather than
//! trusted from a cached flag, so drift introduced out of band is repaired.

use std::path::PathBuf;

use tracing::{debug, error, info};

use super::annotations::parse_time;
use super::binds::{bind_list, reconcile_frontend_binds, BindSettings};
use super::certs::clean_cert_dir;
use super::configuration::Configuration;
use super::handler::{HandlerOutcome, UpdateHandler};
use crate::error::Result;
use crate::haproxy::rules::Rule;
use crate::haproxy::{
    Backend, Frontend, HaproxyClient, Mode, Server, BACKEND_SSL, FRONTEND_HTTPS, FRONTEND_SSL,
};
use crate::store::{get_value_from_annotations, Store};

pub const DEFAULT_INSPECT_TIMEOUT_MS: i64 = 5000;
const ANN_TIMEOUT_CLIENT: &str = "timeout-client";
const SSL_LOG_FORMAT: &str = "'%ci:%cp [%t] %ft %b/%s %Tw/%Tc/%Tt %B %ts %ac/%fc/%bc/%sc/%rc %sq/%bq %hr %hs %[var(sess.sni)]'";

#[derive(Clone, Debug)]
pub struct Https {
    pub enabled: bool,
    pub binds: BindSettings,
    pub port: u16,
    pub cert_dir: PathBuf,
}

/// Inspect delay of the passthrough frontend, from the global `timeout-client`
pub fn inspect_timeout(store: &Store) -> i64 {
    match get_value_from_annotations(ANN_TIMEOUT_CLIENT, &[store.global_annotations()]) {
        Some(value) => parse_time(&value.value).unwrap_or_else(|e| {
            error!("{} annotation: {}", ANN_TIMEOUT_CLIENT, e);
            DEFAULT_INSPECT_TIMEOUT_MS
        }),
        None => DEFAULT_INSPECT_TIMEOUT_MS,
    }
}

/// Delete the `ssl` frontend and backend, each only when present
fn remove_ssl_objects(api: &mut dyn HaproxyClient) -> Result<()> {
    if api.frontend_get(FRONTEND_SSL).is_ok() {
        api.frontend_delete(FRONTEND_SSL)?;
    }
    if api.backend_get(BACKEND_SSL).is_ok() {
        api.backend_delete(BACKEND_SSL)?;
    }
    Ok(())
}

/// Passthrough state as found in the proxy: `(complete, any part present)`
fn ssl_passthrough_state(api: &dyn HaproxyClient) -> (bool, bool) {
    let frontend = api.frontend_get(FRONTEND_SSL).is_ok();
    let backend = api.backend_get(BACKEND_SSL).is_ok();
    let chained = api
        .frontend_binds(FRONTEND_HTTPS)
        .map(|binds| binds.iter().any(|b| b.accept_proxy))
        .unwrap_or(false);
    (
        frontend && backend && chained,
        frontend || backend || chained,
    )
}

impl Https {
    fn enable_ssl_passthrough(&self, offload: bool, api: &mut dyn HaproxyClient) -> Result<()> {
        // leftovers of a partial topology would make the creates fail
        remove_ssl_objects(api)?;
        api.frontend_create(Frontend {
            name: FRONTEND_SSL.to_string(),
            mode: Mode::Tcp,
            log_format: Some(SSL_LOG_FORMAT.to_string()),
            default_backend: Some(BACKEND_SSL.to_string()),
            binds: Vec::new(),
        })?;
        for bind in bind_list(&self.binds, self.port, false) {
            api.frontend_bind_create(FRONTEND_SSL, bind)?;
        }
        api.backend_create(Backend {
            name: BACKEND_SSL.to_string(),
            mode: Mode::Tcp,
            servers: Vec::new(),
        })?;
        api.backend_server_create(
            BACKEND_SSL,
            Server {
                name: FRONTEND_HTTPS.to_string(),
                address: self.binds.loopback().to_string(),
                port: Some(self.port),
                send_proxy_v2: true,
            },
        )?;
        self.toggle_ssl_passthrough(true, offload, api)
    }

    /// Remove whatever is left of the topology and put HTTPS back on the
    /// public addresses. The rebind runs even when a removal fails.
    fn disable_ssl_passthrough(&self, offload: bool, api: &mut dyn HaproxyClient) -> Result<()> {
        let removed = remove_ssl_objects(api);
        let rebound = self.toggle_ssl_passthrough(false, offload, api);
        removed.and(rebound)
    }

    /// Undo a half-done enable so the next cycle starts from a clean slate
    fn rollback_ssl_passthrough(&self, offload: bool, api: &mut dyn HaproxyClient) {
        if let Err(e) = self.disable_ssl_passthrough(offload, api) {
            error!("Failed to roll back ssl-passthrough: {}", e);
        }
    }

    /// Rebind the HTTPS frontend. Editing a bind drops its TLS settings, so
    /// offload is switched back on afterwards when it was active.
    fn toggle_ssl_passthrough(
        &self,
        passthrough: bool,
        offload: bool,
        api: &mut dyn HaproxyClient,
    ) -> Result<()> {
        let binds = bind_list(&self.binds, self.port, passthrough);
        reconcile_frontend_binds(api, FRONTEND_HTTPS, &binds)?;
        if offload {
            api.frontend_enable_ssl_offload(FRONTEND_HTTPS, &self.cert_dir, true)?;
        }
        Ok(())
    }

    fn ssl_passthrough_rules(&self, store: &Store, cfg: &mut Configuration) -> Result<()> {
        let timeout_ms = inspect_timeout(store);
        let rules = &mut cfg.haproxy_rules;
        rules.enable_ssl_passthrough(FRONTEND_SSL, FRONTEND_HTTPS);
        rules.add_rule(Rule::ReqAcceptContent, FRONTEND_SSL)?;
        rules.add_rule(
            Rule::ReqSetVar {
                name: "sni".to_string(),
                scope: "sess".to_string(),
                expression: "req_ssl_sni".to_string(),
            },
            FRONTEND_SSL,
        )?;
        rules.add_rule(Rule::ReqInspectDelay { timeout_ms }, FRONTEND_SSL)?;
        Ok(())
    }
}

impl UpdateHandler for Https {
    fn name(&self) -> &'static str {
        "https"
    }

    fn update(
        &self,
        store: &Store,
        cfg: &mut Configuration,
        api: &mut dyn HaproxyClient,
    ) -> HandlerOutcome {
        let mut outcome = HandlerOutcome::default();
        if !self.enabled {
            debug!("Cannot proceed with SSL Passthrough update, HTTPS is disabled");
            return outcome;
        }

        // ssl-offload
        if !cfg.used_certs.is_empty() {
            if !cfg.https {
                info!("Enabling ssl offload");
                match api.frontend_enable_ssl_offload(FRONTEND_HTTPS, &self.cert_dir, true) {
                    Ok(()) => {
                        cfg.https = true;
                        outcome.reload = true;
                    }
                    Err(e) => outcome.push_error(e),
                }
            }
        } else if cfg.https {
            info!("Disabling ssl offload");
            match api.frontend_disable_ssl_offload(FRONTEND_HTTPS) {
                Ok(()) => {
                    cfg.https = false;
                    outcome.reload = true;
                }
                Err(e) => outcome.push_error(e),
            }
        }

        // ssl-passthrough
        let (complete, present) = ssl_passthrough_state(api);
        let wanted = cfg.ssl_passthrough || cfg.ingress_routes.passthrough_requested();
        if wanted {
            if !complete {
                info!("Enabling ssl-passthrough");
                match self.enable_ssl_passthrough(cfg.https, api) {
                    Ok(()) => outcome.reload = true,
                    Err(e) => {
                        self.rollback_ssl_passthrough(cfg.https, api);
                        // the rollback still cleared a partial topology
                        outcome.reload |= present;
                        outcome.push_error(e);
                    }
                }
            }
            if let Err(e) = self.ssl_passthrough_rules(store, cfg) {
                outcome.push_error(e);
            }
        } else if present {
            info!("Disabling ssl-passthrough");
            outcome.reload = true;
            if let Err(e) = self.disable_ssl_passthrough(cfg.https, api) {
                outcome.push_error(e);
            }
        }

        // remove certs that are not needed
        match clean_cert_dir(&self.cert_dir, &cfg.used_certs) {
            Ok(removed) => outcome.reload |= removed,
            Err(e) => outcome.push_error(e),
        }

        outcome
    }
}
