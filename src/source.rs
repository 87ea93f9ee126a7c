//! Manifest file event source
//!
//! Watches a multi-document YAML file of Kubernetes objects and turns the
//! differences between two reads into store events. It stands in for a
//! cluster watch when the controller runs against static manifests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::controller::SyncEvent;
use crate::error::{Error, Result};
use crate::store::K8sObject;

/// Parse every supported object of a multi-document YAML manifest.
/// Documents of other kinds are skipped.
pub fn parse_manifests(content: &str) -> Result<Vec<K8sObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| Error::ManifestError("document without kind".to_string()))?
            .to_string();
        let object = match kind.as_str() {
            "Namespace" => K8sObject::Namespace(serde_yaml::from_value(value)?),
            "Ingress" => K8sObject::Ingress(serde_yaml::from_value(value)?),
            "Service" => K8sObject::Service(serde_yaml::from_value(value)?),
            "Secret" => K8sObject::Secret(serde_yaml::from_value(value)?),
            "ConfigMap" => K8sObject::ConfigMap(serde_yaml::from_value(value)?),
            other => {
                debug!("Skipping manifest of kind {}", other);
                continue;
            }
        };
        objects.push(object);
    }
    Ok(objects)
}

fn object_id(obj: &K8sObject) -> String {
    format!("{}:{}", obj.kind(), obj.key())
}

pub struct ManifestSource {
    path: PathBuf,
    interval: Duration,
    known: BTreeMap<String, K8sObject>,
    loaded: bool,
}

impl ManifestSource {
    pub fn new<P: Into<PathBuf>>(path: P, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            known: BTreeMap::new(),
            loaded: false,
        }
    }

    /// Read the file and return the events that bring the store from the
    /// previous read to this one. The first successful read ends with a
    /// resync so an initial cycle runs even for an empty manifest.
    pub fn poll(&mut self) -> Result<Vec<SyncEvent>> {
        let content = std::fs::read_to_string(&self.path)?;
        let current: BTreeMap<String, K8sObject> = parse_manifests(&content)?
            .into_iter()
            .map(|obj| (object_id(&obj), obj))
            .collect();

        let mut events = Vec::new();
        for (id, obj) in &self.known {
            if !current.contains_key(id) {
                events.push(SyncEvent::Delete(Box::new(obj.clone())));
            }
        }
        for (id, obj) in &current {
            if self.known.get(id) != Some(obj) {
                events.push(SyncEvent::Upsert(Box::new(obj.clone())));
            }
        }
        if !self.loaded {
            self.loaded = true;
            events.push(SyncEvent::Resync);
        }
        self.known = current;
        Ok(events)
    }

    /// Poll on every interval tick until shutdown or until the worker is gone
    pub async fn run(mut self, tx: mpsc::Sender<SyncEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watching manifests in {} every {:?}",
            self.path.display(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let events = match self.poll() {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot load manifests from {}: {}", self.path.display(), e);
                    continue;
                }
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    debug!("Event queue closed, stopping manifest source");
                    return;
                }
            }
        }
    }
}
