//! HAProxy configuration model and the transaction contract
//!
//! The controller never edits `haproxy.cfg` directly. Every mutation goes
//! through a [`HaproxyClient`] inside a transaction: start, mutate, commit,
//! dispose. Nothing staged reaches the live configuration until a commit
//! succeeds.

pub mod memory;
pub mod rules;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::route::Route;

pub use memory::{MemoryClient, ProxyConfig};
pub use rules::{HaproxyRules, Rule};

/// Frontend receiving plain HTTP traffic
pub const FRONTEND_HTTP: &str = "http";
/// Frontend terminating TLS
pub const FRONTEND_HTTPS: &str = "https";
/// TCP frontend inspecting SNI in passthrough mode
pub const FRONTEND_SSL: &str = "ssl";
/// Backend chaining the passthrough frontend into the HTTPS frontend
pub const BACKEND_SSL: &str = "ssl";
pub const BACKEND_HTTP_DEFAULT: &str = "http_default";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("no transaction in progress")]
    NoTransaction,

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("{kind} '{name}' does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("commit rejected: {0}")]
    CommitRejected(String),
}

impl ClientError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, name: &str) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Http,
    Tcp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    pub name: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
    #[serde(default)]
    pub binds: Vec<Bind>,
}

/// A listening endpoint of a frontend, identified by its positional name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub v4v6: bool,
    #[serde(default)]
    pub accept_proxy: bool,
    #[serde(default)]
    pub ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub mode: Mode,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub send_proxy_v2: bool,
}

/// Configuration section targeted by a plain option write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Global,
    Defaults,
}

/// Transactional access to the running proxy configuration
///
/// Object operations are only valid between `start_transaction` and
/// `commit_transaction`/`dispose_transaction`; reads observe the staged state.
pub trait HaproxyClient: Send {
    fn start_transaction(&mut self) -> Result<(), ClientError>;
    fn commit_transaction(&mut self) -> Result<(), ClientError>;
    /// Drop whatever is staged. Safe to call without an open transaction.
    fn dispose_transaction(&mut self);

    fn frontend_get(&self, name: &str) -> Result<Frontend, ClientError>;
    fn frontend_create(&mut self, frontend: Frontend) -> Result<(), ClientError>;
    fn frontend_delete(&mut self, name: &str) -> Result<(), ClientError>;

    fn frontend_binds(&self, frontend: &str) -> Result<Vec<Bind>, ClientError>;
    fn frontend_bind_create(&mut self, frontend: &str, bind: Bind) -> Result<(), ClientError>;
    fn frontend_bind_edit(&mut self, frontend: &str, bind: Bind) -> Result<(), ClientError>;
    fn frontend_bind_delete(&mut self, frontend: &str, bind: &str) -> Result<(), ClientError>;

    fn frontend_enable_ssl_offload(
        &mut self,
        frontend: &str,
        cert_dir: &Path,
        alpn: bool,
    ) -> Result<(), ClientError>;
    fn frontend_disable_ssl_offload(&mut self, frontend: &str) -> Result<(), ClientError>;

    fn backend_get(&self, name: &str) -> Result<Backend, ClientError>;
    fn backend_create(&mut self, backend: Backend) -> Result<(), ClientError>;
    fn backend_delete(&mut self, name: &str) -> Result<(), ClientError>;
    fn backend_server_create(&mut self, backend: &str, server: Server)
        -> Result<(), ClientError>;

    /// Set (`Some`) or unset (`None`) a single option of the global or defaults section
    fn option_write(
        &mut self,
        section: Section,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClientError>;

    /// Replace the routes and frontend rules handed to the config renderer.
    /// Returns whether they differ from what was staged before.
    fn routing_write(&mut self, routes: &[Route], rules: &HaproxyRules)
        -> Result<bool, ClientError>;
}
