//! Declarative state observed from the cluster
//!
//! The store is refreshed from watch events between sync cycles and read by
//! the reconciliation engine during a cycle. Every object carries a
//! [`Status`] marker; deleted objects stay in place, flagged, until the next
//! successful commit calls [`Store::clean`].

pub mod annotations;
pub mod convert;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use annotations::{get_value_from_annotations, Annotations, Status, StringW};
pub use convert::K8sObject;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePort {
    Number(i32),
    Name(String),
}

impl Default for ServicePort {
    fn default() -> Self {
        ServicePort::Number(0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
    ImplementationSpecific,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub path_type: PathType,
    pub service_name: String,
    pub service_port: ServicePort,
    pub is_default_backend: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressRule {
    pub host: String,
    pub paths: Vec<IngressPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ingress {
    pub namespace: String,
    pub name: String,
    pub annotations: Annotations,
    pub rules: Vec<IngressRule>,
    pub default_backend: Option<IngressPath>,
    /// TLS bindings keyed by secret name
    pub tls: BTreeMap<String, IngressTls>,
    pub status: Status,
}

impl Ingress {
    fn same_spec(&self, other: &Ingress) -> bool {
        self.rules == other.rules
            && self.default_backend == other.default_backend
            && self.tls == other.tls
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub name: Option<String>,
    pub port: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub ports: Vec<ServicePortSpec>,
    pub annotations: Annotations,
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    /// Irrelevant namespaces are watched but never turned into configuration
    pub relevant: bool,
    pub ingresses: BTreeMap<String, Ingress>,
    pub services: BTreeMap<String, Service>,
    pub secrets: BTreeMap<String, Secret>,
    pub status: Status,
}

/// Which namespaces this controller instance serves
#[derive(Clone, Debug, Default)]
pub struct NamespaceFilter {
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
}

impl NamespaceFilter {
    pub fn is_relevant(&self, namespace: &str) -> bool {
        (self.whitelist.is_empty() || self.whitelist.contains(namespace))
            && !self.blacklist.contains(namespace)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Store {
    pub namespaces: BTreeMap<String, Namespace>,
    /// Annotations of the controller's main ConfigMap
    pub global: Annotations,
    filter: NamespaceFilter,
    main_config_map: Option<(String, String)>,
}

impl Store {
    pub fn new(filter: NamespaceFilter, main_config_map: Option<(String, String)>) -> Self {
        Self {
            filter,
            main_config_map,
            ..Default::default()
        }
    }

    pub fn global_annotations(&self) -> &Annotations {
        &self.global
    }

    pub fn is_main_config_map(&self, namespace: &str, name: &str) -> bool {
        self.main_config_map
            .as_ref()
            .map(|(ns, n)| ns == namespace && n == name)
            .unwrap_or(false)
    }

    /// Get a namespace, creating it (marked added) when first referenced.
    /// A namespace deleted earlier in the cycle is brought back as modified.
    pub fn namespace_mut(&mut self, name: &str) -> &mut Namespace {
        let relevant = self.filter.is_relevant(name);
        let ns = self
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                name: name.to_string(),
                relevant,
                status: Status::Added,
                ..Default::default()
            });
        if ns.status == Status::Deleted {
            ns.status = Status::Modified;
        }
        ns
    }

    pub fn upsert_ingress(&mut self, mut ingress: Ingress) -> bool {
        let ns = self.namespace_mut(&ingress.namespace);
        match ns.ingresses.get_mut(&ingress.name) {
            Some(current) => {
                let values = annotation_values(&ingress.annotations);
                let annotations_changed = current.annotations.update(&values);
                let spec_changed = !current.same_spec(&ingress);
                let resurrected = current.status == Status::Deleted;
                if !(annotations_changed || spec_changed || resurrected) {
                    return false;
                }
                current.rules = ingress.rules;
                current.default_backend = ingress.default_backend;
                current.tls = ingress.tls;
                current.status = next_status(current.status);
                true
            }
            None => {
                ingress.status = Status::Added;
                ns.ingresses.insert(ingress.name.clone(), ingress);
                true
            }
        }
    }

    pub fn delete_ingress(&mut self, namespace: &str, name: &str) -> bool {
        self.namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.ingresses.get_mut(name))
            .map(|ingress| {
                ingress.annotations.mark_deleted();
                mark_deleted(&mut ingress.status)
            })
            .unwrap_or(false)
    }

    pub fn upsert_service(&mut self, mut service: Service) -> bool {
        let ns = self.namespace_mut(&service.namespace);
        match ns.services.get_mut(&service.name) {
            Some(current) => {
                let values = annotation_values(&service.annotations);
                let annotations_changed = current.annotations.update(&values);
                let ports_changed = current.ports != service.ports;
                let resurrected = current.status == Status::Deleted;
                if !(annotations_changed || ports_changed || resurrected) {
                    return false;
                }
                current.ports = service.ports;
                current.status = next_status(current.status);
                true
            }
            None => {
                service.status = Status::Added;
                ns.services.insert(service.name.clone(), service);
                true
            }
        }
    }

    pub fn delete_service(&mut self, namespace: &str, name: &str) -> bool {
        self.namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.services.get_mut(name))
            .map(|service| {
                service.annotations.mark_deleted();
                mark_deleted(&mut service.status)
            })
            .unwrap_or(false)
    }

    pub fn upsert_secret(&mut self, mut secret: Secret) -> bool {
        let ns = self.namespace_mut(&secret.namespace);
        match ns.secrets.get_mut(&secret.name) {
            Some(current) => {
                if current.data == secret.data && current.status != Status::Deleted {
                    return false;
                }
                current.data = secret.data;
                current.status = next_status(current.status);
                true
            }
            None => {
                secret.status = Status::Added;
                ns.secrets.insert(secret.name.clone(), secret);
                true
            }
        }
    }

    pub fn delete_secret(&mut self, namespace: &str, name: &str) -> bool {
        self.namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.secrets.get_mut(name))
            .map(|secret| mark_deleted(&mut secret.status))
            .unwrap_or(false)
    }

    /// Apply ConfigMap data; only the main ConfigMap is tracked
    pub fn upsert_config_map(
        &mut self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> bool {
        if !self.is_main_config_map(namespace, name) {
            return false;
        }
        self.global.update(data)
    }

    pub fn delete_config_map(&mut self, namespace: &str, name: &str) -> bool {
        if !self.is_main_config_map(namespace, name) {
            return false;
        }
        let had_values = self.global.iter().any(|(_, v)| !v.is_deleted());
        self.global.mark_deleted();
        had_values
    }

    pub fn delete_namespace(&mut self, name: &str) -> bool {
        let Some(ns) = self.namespaces.get_mut(name) else {
            return false;
        };
        for ingress in ns.ingresses.values_mut() {
            ingress.annotations.mark_deleted();
            ingress.status = Status::Deleted;
        }
        for service in ns.services.values_mut() {
            service.annotations.mark_deleted();
            service.status = Status::Deleted;
        }
        for secret in ns.secrets.values_mut() {
            secret.status = Status::Deleted;
        }
        mark_deleted(&mut ns.status)
    }

    /// Forget deleted objects and reset change markers after a successful commit
    pub fn clean(&mut self) {
        self.namespaces.retain(|_, ns| ns.status != Status::Deleted);
        for ns in self.namespaces.values_mut() {
            ns.status = Status::Empty;
            ns.ingresses.retain(|_, i| i.status != Status::Deleted);
            for ingress in ns.ingresses.values_mut() {
                ingress.status = Status::Empty;
                ingress.annotations.clean();
            }
            ns.services.retain(|_, s| s.status != Status::Deleted);
            for service in ns.services.values_mut() {
                service.status = Status::Empty;
                service.annotations.clean();
            }
            ns.secrets.retain(|_, s| s.status != Status::Deleted);
            for secret in ns.secrets.values_mut() {
                secret.status = Status::Empty;
            }
        }
        self.global.clean();
    }
}

fn annotation_values(annotations: &Annotations) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(_, v)| !v.is_deleted())
        .map(|(k, v)| (k.clone(), v.value.clone()))
        .collect()
}

/// An object added since the last commit stays "added" when it changes again
fn next_status(current: Status) -> Status {
    match current {
        Status::Added => Status::Added,
        _ => Status::Modified,
    }
}

fn mark_deleted(status: &mut Status) -> bool {
    if *status == Status::Deleted {
        return false;
    }
    *status = Status::Deleted;
    true
}
