//! Conversion of Kubernetes objects into store entries
//!
//! This is the boundary with the watch layer: whatever observes the cluster
//! hands over `k8s-openapi` objects, and the store keeps only what the sync
//! cycle needs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as core;
use k8s_openapi::api::networking::v1 as networking;
use kube::ResourceExt;

use super::{
    Annotations, Ingress, IngressPath, IngressRule, IngressTls, PathType, Secret, Service,
    ServicePort, ServicePortSpec, Status, Store,
};

/// An object observed in the cluster
#[derive(Clone, Debug, PartialEq)]
pub enum K8sObject {
    Namespace(core::Namespace),
    Ingress(networking::Ingress),
    Service(core::Service),
    Secret(core::Secret),
    ConfigMap(core::ConfigMap),
}

impl K8sObject {
    pub fn kind(&self) -> &'static str {
        match self {
            K8sObject::Namespace(_) => "Namespace",
            K8sObject::Ingress(_) => "Ingress",
            K8sObject::Service(_) => "Service",
            K8sObject::Secret(_) => "Secret",
            K8sObject::ConfigMap(_) => "ConfigMap",
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects
    pub fn key(&self) -> String {
        let (namespace, name) = match self {
            K8sObject::Namespace(o) => (None, o.name_any()),
            K8sObject::Ingress(o) => (o.namespace(), o.name_any()),
            K8sObject::Service(o) => (o.namespace(), o.name_any()),
            K8sObject::Secret(o) => (o.namespace(), o.name_any()),
            K8sObject::ConfigMap(o) => (o.namespace(), o.name_any()),
        };
        match namespace {
            Some(ns) => format!("{}/{}", ns, name),
            None => name,
        }
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

fn path_from_backend(backend: &networking::IngressBackend) -> Option<IngressPath> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref();
    let service_port = match (
        port.and_then(|p| p.number),
        port.and_then(|p| p.name.clone()),
    ) {
        (Some(number), _) => ServicePort::Number(number),
        (None, Some(name)) => ServicePort::Name(name),
        (None, None) => ServicePort::default(),
    };
    Some(IngressPath {
        service_name: service.name.clone(),
        service_port,
        ..Default::default()
    })
}

fn path_type(value: &str) -> PathType {
    match value {
        "Exact" => PathType::Exact,
        "ImplementationSpecific" => PathType::ImplementationSpecific,
        _ => PathType::Prefix,
    }
}

pub fn ingress_from_k8s(obj: &networking::Ingress) -> Ingress {
    let spec = obj.spec.clone().unwrap_or_default();

    let default_backend = spec
        .default_backend
        .as_ref()
        .and_then(path_from_backend)
        .map(|mut path| {
            path.is_default_backend = true;
            path
        });

    let rules = spec
        .rules
        .unwrap_or_default()
        .into_iter()
        .map(|rule| IngressRule {
            host: rule.host.unwrap_or_default(),
            paths: rule
                .http
                .map(|http| {
                    http.paths
                        .iter()
                        .filter_map(|p| {
                            path_from_backend(&p.backend).map(|mut path| {
                                path.path = p.path.clone().unwrap_or_else(|| "/".to_string());
                                path.path_type = path_type(&p.path_type);
                                path
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect();

    let tls = spec
        .tls
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tls| {
            let secret_name = tls.secret_name?;
            Some((
                secret_name.clone(),
                IngressTls {
                    hosts: tls.hosts.unwrap_or_default(),
                    secret_name,
                },
            ))
        })
        .collect();

    Ingress {
        namespace: namespace_of(obj),
        name: obj.name_any(),
        annotations: Annotations::added(obj.annotations()),
        rules,
        default_backend,
        tls,
        status: Status::Added,
    }
}

pub fn service_from_k8s(obj: &core::Service) -> Service {
    let ports = obj
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePortSpec {
                    name: p.name.clone(),
                    port: p.port,
                })
                .collect()
        })
        .unwrap_or_default();
    Service {
        namespace: namespace_of(obj),
        name: obj.name_any(),
        ports,
        annotations: Annotations::added(obj.annotations()),
        status: Status::Added,
    }
}

pub fn secret_from_k8s(obj: &core::Secret) -> Secret {
    let mut data: BTreeMap<String, Vec<u8>> = obj
        .data
        .as_ref()
        .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default();
    // stringData is write-only on the API server, but manifests may carry it
    if let Some(string_data) = &obj.string_data {
        for (k, v) in string_data {
            data.insert(k.clone(), v.clone().into_bytes());
        }
    }
    Secret {
        namespace: namespace_of(obj),
        name: obj.name_any(),
        data,
        status: Status::Added,
    }
}

impl Store {
    /// Apply an added or modified object. Returns whether the store changed.
    pub fn apply(&mut self, obj: &K8sObject) -> bool {
        match obj {
            K8sObject::Namespace(ns) => {
                let name = ns.name_any();
                let current = self.namespaces.get(&name).map(|n| n.status);
                self.namespace_mut(&name);
                matches!(current, None | Some(Status::Deleted))
            }
            K8sObject::Ingress(ingress) => self.upsert_ingress(ingress_from_k8s(ingress)),
            K8sObject::Service(service) => self.upsert_service(service_from_k8s(service)),
            K8sObject::Secret(secret) => self.upsert_secret(secret_from_k8s(secret)),
            K8sObject::ConfigMap(cm) => self.upsert_config_map(
                &namespace_of(cm),
                &cm.name_any(),
                &cm.data.clone().unwrap_or_default(),
            ),
        }
    }

    /// Apply a deletion. Returns whether the store changed.
    pub fn remove(&mut self, obj: &K8sObject) -> bool {
        match obj {
            K8sObject::Namespace(ns) => self.delete_namespace(&ns.name_any()),
            K8sObject::Ingress(o) => self.delete_ingress(&namespace_of(o), &o.name_any()),
            K8sObject::Service(o) => self.delete_service(&namespace_of(o), &o.name_any()),
            K8sObject::Secret(o) => self.delete_secret(&namespace_of(o), &o.name_any()),
            K8sObject::ConfigMap(o) => self.delete_config_map(&namespace_of(o), &o.name_any()),
        }
    }
}
