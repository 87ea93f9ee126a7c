//! Single consumer of store events
//!
//! Producers push events into a bounded queue. The worker drains whatever is
//! pending, applies it to the store and runs at most one sync cycle per batch.
//! Cycles never overlap; shutdown is only observed between cycles.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::reconciler::Controller;
use crate::haproxy::HaproxyClient;
use crate::store::K8sObject;

#[derive(Clone, Debug)]
pub enum SyncEvent {
    Upsert(Box<K8sObject>),
    Delete(Box<K8sObject>),
    /// Run a cycle even if no object changed
    Resync,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<SyncEvent>, mpsc::Receiver<SyncEvent>) {
    mpsc::channel(capacity)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub events: usize,
    pub cycles: usize,
    pub failed_cycles: usize,
}

/// Apply a batch of events. Returns whether a cycle is needed.
fn apply_events<C: HaproxyClient>(controller: &mut Controller<C>, events: &[SyncEvent]) -> bool {
    let mut sync = false;
    for event in events {
        let changed = match event {
            SyncEvent::Upsert(obj) => controller.store_mut().apply(obj),
            SyncEvent::Delete(obj) => controller.store_mut().remove(obj),
            SyncEvent::Resync => true,
        };
        sync |= changed;
    }
    sync
}

/// Consume events until the queue closes or shutdown is signalled
pub async fn run_worker<C: HaproxyClient>(
    controller: &mut Controller<C>,
    mut rx: mpsc::Receiver<SyncEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    info!("Sync worker started");

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("Shutdown requested, stopping sync worker");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    info!("Event queue closed, stopping sync worker");
                    break;
                }
            },
        };

        let mut batch = vec![first];
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }
        stats.events += batch.len();
        debug!("Processing {} events", batch.len());

        if !apply_events(controller, &batch) {
            continue;
        }
        if *shutdown.borrow() {
            break;
        }

        stats.cycles += 1;
        match controller.update_haproxy().await {
            Ok(report) => debug!(
                "Cycle done: {:?}, {} routes",
                report.action,
                report.routes.len()
            ),
            Err(e) => {
                stats.failed_cycles += 1;
                warn!("Sync cycle failed (retriable: {}): {}", e.is_retriable(), e);
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::binds::BindSettings;
    use crate::controller::reconciler::ControllerSettings;
    use crate::controller::service::{ServiceAction, ServiceControl};
    use crate::error::Result;
    use crate::haproxy::{MemoryClient, ProxyConfig};
    use crate::store::{NamespaceFilter, Store};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    struct NoopService;

    #[async_trait]
    impl ServiceControl for NoopService {
        async fn control(&self, _action: ServiceAction) -> Result<()> {
            Ok(())
        }
    }

    fn controller() -> Controller<MemoryClient> {
        let settings = ControllerSettings {
            default_backend_service: None,
            cert_dir: std::env::temp_dir(),
            binds: BindSettings {
                ipv4: true,
                ipv4_addr: "0.0.0.0".to_string(),
                ipv6: false,
                ipv6_addr: "::".to_string(),
            },
            http_port: Some(80),
            https_port: None,
        };
        let store = Store::new(
            NamespaceFilter::default(),
            Some(("haproxy".to_string(), "config".to_string())),
        );
        Controller::new(
            store,
            MemoryClient::new(ProxyConfig::base()),
            Arc::new(NoopService),
            settings,
        )
    }

    fn service(name: &str) -> SyncEvent {
        SyncEvent::Upsert(Box::new(K8sObject::Service(Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })))
    }

    fn unrelated_config_map() -> SyncEvent {
        SyncEvent::Upsert(Box::new(K8sObject::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some("unrelated".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        })))
    }

    #[tokio::test]
    async fn test_pending_events_are_coalesced() {
        let mut controller = controller();
        let (tx, rx) = channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        for name in ["a", "b", "c"] {
            tx.send(service(name)).await.unwrap();
        }
        drop(tx);

        let stats = run_worker(&mut controller, rx, shutdown_rx).await;
        assert_eq!(stats.events, 3);
        assert_eq!(stats.cycles, 1);
        assert_eq!(controller.client().commit_count(), 1);
        assert_eq!(controller.store().namespaces["default"].services.len(), 3);
    }

    #[tokio::test]
    async fn test_no_cycle_without_changes() {
        let mut controller = controller();
        let (tx, rx) = channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(unrelated_config_map()).await.unwrap();
        drop(tx);

        let stats = run_worker(&mut controller, rx, shutdown_rx).await;
        assert_eq!(stats.cycles, 0);
        assert_eq!(controller.client().commit_count(), 0);
    }

    #[tokio::test]
    async fn test_resync_forces_cycle() {
        let mut controller = controller();
        let (tx, rx) = channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(SyncEvent::Resync).await.unwrap();
        drop(tx);

        let stats = run_worker(&mut controller, rx, shutdown_rx).await;
        assert_eq!(stats.cycles, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_is_counted() {
        let mut controller = controller();
        controller.client_mut().reject_next_commit("read-only");
        let (tx, rx) = channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(service("a")).await.unwrap();
        drop(tx);

        let stats = run_worker(&mut controller, rx, shutdown_rx).await;
        assert_eq!(stats.failed_cycles, 1);
        assert_eq!(controller.client().commit_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let mut controller = controller();
        let (tx, rx) = channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        shutdown_tx.send(true).unwrap();
        let stats = run_worker(&mut controller, rx, shutdown_rx).await;
        assert_eq!(stats.cycles, 0);
        drop(tx);
    }
}
