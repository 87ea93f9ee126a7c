//! haproxy-ingress: reconciliation core of an HAProxy ingress controller
//!
//! This crate turns the declarative routing state of a Kubernetes cluster
//! (ingresses, services, TLS secrets, annotations) into transactional updates
//! of a running HAProxy, and decides whether the proxy needs a reload or a
//! restart to pick them up.

pub mod config;
pub mod controller;
pub mod environment;
pub mod error;
pub mod haproxy;
pub mod route;
pub mod source;
pub mod store;

pub use crate::error::{Error, Result};
