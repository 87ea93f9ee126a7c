//! In-memory transaction client
//!
//! Keeps a committed [`ProxyConfig`] and, while a transaction is open, a staged
//! copy that all mutations and reads go through. Commit swaps the staged copy
//! in; dispose drops it. Optionally persists the committed model as JSON so an
//! external renderer can pick it up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    Backend, Bind, ClientError, Frontend, HaproxyClient, HaproxyRules, Mode, Section, Server,
    BACKEND_HTTP_DEFAULT, FRONTEND_HTTP, FRONTEND_HTTPS,
};
use crate::route::Route;

const DEFAULT_ALPN: &str = "h2,http/1.1";

/// Complete proxy model as seen through the client
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub frontends: BTreeMap<String, Frontend>,
    pub backends: BTreeMap<String, Backend>,
    pub global: BTreeMap<String, String>,
    pub defaults: BTreeMap<String, String>,
    /// Routes of the last committed cycle, in discovery order
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub rules: HaproxyRules,
}

impl ProxyConfig {
    /// The shape of the base `haproxy.cfg` shipped with the controller:
    /// `http` and `https` frontends without binds, plus the default backend.
    pub fn base() -> Self {
        let mut cfg = Self::default();
        for name in [FRONTEND_HTTP, FRONTEND_HTTPS] {
            cfg.frontends.insert(
                name.to_string(),
                Frontend {
                    name: name.to_string(),
                    mode: Mode::Http,
                    default_backend: Some(BACKEND_HTTP_DEFAULT.to_string()),
                    ..Default::default()
                },
            );
        }
        cfg.backends.insert(
            BACKEND_HTTP_DEFAULT.to_string(),
            Backend {
                name: BACKEND_HTTP_DEFAULT.to_string(),
                mode: Mode::Http,
                servers: Vec::new(),
            },
        );
        cfg
    }

    fn frontend_mut(&mut self, name: &str) -> Result<&mut Frontend, ClientError> {
        self.frontends
            .get_mut(name)
            .ok_or_else(|| ClientError::not_found("frontend", name))
    }
}

#[derive(Debug, Default)]
pub struct MemoryClient {
    committed: ProxyConfig,
    staged: Option<ProxyConfig>,
    snapshot_path: Option<PathBuf>,
    reject_next_commit: Option<String>,
    reject_next_start: bool,
    commits: usize,
}

impl MemoryClient {
    pub fn new(initial: ProxyConfig) -> Self {
        Self {
            committed: initial,
            ..Default::default()
        }
    }

    /// Persist the committed model to `path` after every successful commit
    pub fn with_snapshot<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// The configuration the live proxy currently runs with
    pub fn committed(&self) -> &ProxyConfig {
        &self.committed
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    /// Make the next commit fail with `reason`, leaving the committed model untouched
    pub fn reject_next_commit<S: Into<String>>(&mut self, reason: S) {
        self.reject_next_commit = Some(reason.into());
    }

    pub fn reject_next_start(&mut self) {
        self.reject_next_start = true;
    }

    fn staged(&self) -> Result<&ProxyConfig, ClientError> {
        self.staged.as_ref().ok_or(ClientError::NoTransaction)
    }

    fn staged_mut(&mut self) -> Result<&mut ProxyConfig, ClientError> {
        self.staged.as_mut().ok_or(ClientError::NoTransaction)
    }

    fn write_snapshot(&self, path: &Path) -> crate::error::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.committed)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl HaproxyClient for MemoryClient {
    fn start_transaction(&mut self) -> Result<(), ClientError> {
        if self.reject_next_start {
            self.reject_next_start = false;
            return Err(ClientError::CommitRejected(
                "transaction storage unavailable".to_string(),
            ));
        }
        if self.staged.is_some() {
            return Err(ClientError::TransactionInProgress);
        }
        self.staged = Some(self.committed.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), ClientError> {
        if self.staged.is_none() {
            return Err(ClientError::NoTransaction);
        }
        if let Some(reason) = self.reject_next_commit.take() {
            return Err(ClientError::CommitRejected(reason));
        }
        if let Some(staged) = self.staged.take() {
            self.committed = staged;
        }
        self.commits += 1;
        debug!("Transaction committed ({} total)", self.commits);
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.write_snapshot(path) {
                warn!("Failed to write configuration snapshot {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn dispose_transaction(&mut self) {
        self.staged = None;
    }

    fn frontend_get(&self, name: &str) -> Result<Frontend, ClientError> {
        self.staged()?
            .frontends
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::not_found("frontend", name))
    }

    fn frontend_create(&mut self, frontend: Frontend) -> Result<(), ClientError> {
        let cfg = self.staged_mut()?;
        if cfg.frontends.contains_key(&frontend.name) {
            return Err(ClientError::already_exists("frontend", &frontend.name));
        }
        cfg.frontends.insert(frontend.name.clone(), frontend);
        Ok(())
    }

    fn frontend_delete(&mut self, name: &str) -> Result<(), ClientError> {
        self.staged_mut()?
            .frontends
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::not_found("frontend", name))
    }

    fn frontend_binds(&self, frontend: &str) -> Result<Vec<Bind>, ClientError> {
        Ok(self.frontend_get(frontend)?.binds)
    }

    fn frontend_bind_create(&mut self, frontend: &str, bind: Bind) -> Result<(), ClientError> {
        let fe = self.staged_mut()?.frontend_mut(frontend)?;
        if fe.binds.iter().any(|b| b.name == bind.name) {
            return Err(ClientError::already_exists("bind", &bind.name));
        }
        fe.binds.push(bind);
        Ok(())
    }

    fn frontend_bind_edit(&mut self, frontend: &str, bind: Bind) -> Result<(), ClientError> {
        let fe = self.staged_mut()?.frontend_mut(frontend)?;
        match fe.binds.iter_mut().find(|b| b.name == bind.name) {
            // An edit replaces the whole bind line, offload settings included.
            Some(existing) => {
                *existing = bind;
                Ok(())
            }
            None => Err(ClientError::not_found("bind", &bind.name)),
        }
    }

    fn frontend_bind_delete(&mut self, frontend: &str, bind: &str) -> Result<(), ClientError> {
        let fe = self.staged_mut()?.frontend_mut(frontend)?;
        let before = fe.binds.len();
        fe.binds.retain(|b| b.name != bind);
        if fe.binds.len() == before {
            return Err(ClientError::not_found("bind", bind));
        }
        Ok(())
    }

    fn frontend_enable_ssl_offload(
        &mut self,
        frontend: &str,
        cert_dir: &Path,
        alpn: bool,
    ) -> Result<(), ClientError> {
        let fe = self.staged_mut()?.frontend_mut(frontend)?;
        for bind in fe.binds.iter_mut() {
            bind.ssl = true;
            bind.ssl_certificate = Some(cert_dir.display().to_string());
            bind.alpn = alpn.then(|| DEFAULT_ALPN.to_string());
        }
        Ok(())
    }

    fn frontend_disable_ssl_offload(&mut self, frontend: &str) -> Result<(), ClientError> {
        let fe = self.staged_mut()?.frontend_mut(frontend)?;
        for bind in fe.binds.iter_mut() {
            bind.ssl = false;
            bind.ssl_certificate = None;
            bind.alpn = None;
        }
        Ok(())
    }

    fn backend_get(&self, name: &str) -> Result<Backend, ClientError> {
        self.staged()?
            .backends
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::not_found("backend", name))
    }

    fn backend_create(&mut self, backend: Backend) -> Result<(), ClientError> {
        let cfg = self.staged_mut()?;
        if cfg.backends.contains_key(&backend.name) {
            return Err(ClientError::already_exists("backend", &backend.name));
        }
        cfg.backends.insert(backend.name.clone(), backend);
        Ok(())
    }

    fn backend_delete(&mut self, name: &str) -> Result<(), ClientError> {
        self.staged_mut()?
            .backends
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::not_found("backend", name))
    }

    fn backend_server_create(
        &mut self,
        backend: &str,
        server: Server,
    ) -> Result<(), ClientError> {
        let be = self
            .staged_mut()?
            .backends
            .get_mut(backend)
            .ok_or_else(|| ClientError::not_found("backend", backend))?;
        if be.servers.iter().any(|s| s.name == server.name) {
            return Err(ClientError::already_exists("server", &server.name));
        }
        be.servers.push(server);
        Ok(())
    }

    fn option_write(
        &mut self,
        section: Section,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClientError> {
        let cfg = self.staged_mut()?;
        let options = match section {
            Section::Global => &mut cfg.global,
            Section::Defaults => &mut cfg.defaults,
        };
        match value {
            Some(v) => {
                options.insert(key.to_string(), v.to_string());
            }
            None => {
                options.remove(key);
            }
        }
        Ok(())
    }

    fn routing_write(
        &mut self,
        routes: &[Route],
        rules: &HaproxyRules,
    ) -> Result<bool, ClientError> {
        let cfg = self.staged_mut()?;
        if cfg.routes == routes && &cfg.rules == rules {
            return Ok(false);
        }
        cfg.routes = routes.to_vec();
        cfg.rules = rules.clone();
        Ok(true)
    }
}
