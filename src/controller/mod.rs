//! Controller module for HAProxy ingress reconciliation
//! This module contains the sync cycle, the SSL offload/passthrough handler,
//! certificate and bind reconciliation, and control of the HAProxy process.

pub mod annotations;
pub mod binds;
pub mod certs;
mod configuration;
pub mod handler;
pub mod https;
pub mod ingress;
pub mod proxy_protocol;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod service;
mod worker;

pub use binds::{bind_list, reconcile_frontend_binds, BindSettings};
pub use certs::{clean_cert_dir, handle_tls_secret};
pub use configuration::Configuration;
pub use handler::{HandlerOutcome, UpdateHandler};
pub use https::Https;
pub use proxy_protocol::ProxyProtocol;
pub use reconciler::{
    default_handlers, ssl_passthrough_enabled, Action, Controller, ControllerSettings, SyncReport,
    ANN_DEFAULT_BACKEND_SERVICE, ANN_SSL_PASSTHROUGH, DEFAULT_SERVICE_INGRESS,
};
pub use service::{HaproxyProcess, ServiceAction, ServiceControl};
pub use worker::{channel, run_worker, SyncEvent, WorkerStats};
