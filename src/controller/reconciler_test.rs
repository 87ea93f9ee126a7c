//! Tests for the sync cycle
//!
//! These drive whole cycles against the in-memory transaction client:
//! - routes and certificates collected from the store
//! - default backend resolution
//! - reload/restart decision
//! - failed transactions leaving the live configuration untouched
//! - ssl-passthrough annotation precedence

#[cfg(test)]
mod tests {
    use super::super::certs::cert_file_path;
    use super::super::configuration::Configuration;
    use super::super::handler::{HandlerOutcome, UpdateHandler};
    use super::super::reconciler::*;
    use super::super::service::{ServiceAction, ServiceControl};
    use crate::controller::binds::BindSettings;
    use crate::error::{Error, Result};
    use crate::haproxy::{
        HaproxyClient, MemoryClient, ProxyConfig, Rule, FRONTEND_HTTP, FRONTEND_HTTPS,
        FRONTEND_SSL,
    };
    use crate::store::{
        Annotations, Ingress, IngressPath, IngressRule, IngressTls, NamespaceFilter, Secret,
        Service, ServicePort, ServicePortSpec, Status, Store,
    };
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingService {
        actions: Mutex<Vec<ServiceAction>>,
    }

    impl RecordingService {
        fn actions(&self) -> Vec<ServiceAction> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceControl for RecordingService {
        async fn control(&self, action: ServiceAction) -> Result<()> {
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    struct FailingHandler;

    impl UpdateHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn update(
            &self,
            _store: &Store,
            _cfg: &mut Configuration,
            _api: &mut dyn HaproxyClient,
        ) -> HandlerOutcome {
            let mut outcome = HandlerOutcome::reload(true);
            outcome.push_error(Error::InvalidRule("broken".to_string()));
            outcome
        }
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn settings(cert_dir: &Path) -> ControllerSettings {
        ControllerSettings {
            default_backend_service: None,
            cert_dir: cert_dir.to_path_buf(),
            binds: BindSettings {
                ipv4: true,
                ipv4_addr: "0.0.0.0".to_string(),
                ipv6: false,
                ipv6_addr: "::".to_string(),
            },
            http_port: Some(80),
            https_port: Some(443),
        }
    }

    fn new_store(whitelist: &[&str]) -> Store {
        let filter = NamespaceFilter {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            blacklist: BTreeSet::new(),
        };
        Store::new(filter, Some(("haproxy".to_string(), "config".to_string())))
    }

    fn controller(
        store: Store,
        cert_dir: &Path,
    ) -> (Controller<MemoryClient>, Arc<RecordingService>) {
        controller_with_default(store, cert_dir, None)
    }

    fn controller_with_default(
        store: Store,
        cert_dir: &Path,
        default_backend: Option<&str>,
    ) -> (Controller<MemoryClient>, Arc<RecordingService>) {
        let service = Arc::new(RecordingService::default());
        let mut settings = settings(cert_dir);
        settings.default_backend_service = default_backend.map(str::to_string);
        let mut controller = Controller::new(
            store,
            MemoryClient::new(ProxyConfig::base()),
            service.clone(),
            settings.clone(),
        );
        for handler in default_handlers(&settings) {
            controller.register_handler(handler);
        }
        controller.handle_binds().unwrap();
        (controller, service)
    }

    fn path(service: &str) -> IngressPath {
        IngressPath {
            path: "/".to_string(),
            service_name: service.to_string(),
            service_port: ServicePort::Number(80),
            ..Default::default()
        }
    }

    fn ingress(namespace: &str, name: &str, host: &str, secrets: &[&str]) -> Ingress {
        Ingress {
            namespace: namespace.to_string(),
            name: name.to_string(),
            rules: vec![IngressRule {
                host: host.to_string(),
                paths: vec![path("web")],
            }],
            tls: secrets
                .iter()
                .map(|s| {
                    (
                        s.to_string(),
                        IngressTls {
                            hosts: vec![host.to_string()],
                            secret_name: s.to_string(),
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    fn service(namespace: &str, name: &str, ports: &[i32]) -> Service {
        Service {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ports: ports
                .iter()
                .map(|p| ServicePortSpec {
                    name: None,
                    port: *p,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn tls_secret(namespace: &str, name: &str) -> Secret {
        Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: [
                ("tls.crt".to_string(), b"CERT\n".to_vec()),
                ("tls.key".to_string(), b"KEY\n".to_vec()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    fn https_offloaded(client: &MemoryClient) -> bool {
        let fe = &client.committed().frontends[FRONTEND_HTTPS];
        !fe.binds.is_empty() && fe.binds.iter().all(|b| b.ssl)
    }

    #[tokio::test]
    async fn test_cycle_collects_routes_and_enables_offload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_secret(tls_secret("default", "site-tls"));
        store.upsert_ingress(ingress("default", "site", "site.example.com", &["site-tls"]));
        let (mut controller, service) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();

        assert_eq!(report.action, Action::Reload);
        assert_eq!(report.routes.len(), 1);
        assert_eq!(report.routes[0].host.as_deref(), Some("site.example.com"));
        assert!(https_offloaded(controller.client()));
        assert!(controller.configuration().https);
        assert!(cert_file_path(dir.path(), "default", "site-tls").exists());
        assert_eq!(service.actions(), vec![ServiceAction::Reload]);

        // same content on the next cycle: nothing to do
        let report = controller.update_haproxy().await.unwrap();
        assert_eq!(report.action, Action::None);
        assert!(controller.configuration().https);
        assert_eq!(service.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_used_certs_are_the_distinct_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_secret(tls_secret("default", "a-tls"));
        store.upsert_secret(tls_secret("default", "b-tls"));
        store.upsert_ingress(ingress("default", "one", "one.example.com", &["a-tls", "b-tls"]));
        store.upsert_ingress(ingress("default", "two", "two.example.com", &["a-tls"]));
        std::fs::write(dir.path().join("stale.pem"), "old").unwrap();
        let (mut controller, _) = controller(store, dir.path());

        controller.update_haproxy().await.unwrap();

        let expected: BTreeSet<_> = [
            cert_file_path(dir.path(), "default", "a-tls"),
            cert_file_path(dir.path(), "default", "b-tls"),
        ]
        .into_iter()
        .collect();
        assert_eq!(controller.configuration().used_certs, expected);
        assert!(!dir.path().join("stale.pem").exists());
    }

    #[tokio::test]
    async fn test_dropped_certificate_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_secret(tls_secret("default", "a-tls"));
        store.upsert_secret(tls_secret("default", "b-tls"));
        store.upsert_ingress(ingress("default", "one", "one.example.com", &["a-tls"]));
        store.upsert_ingress(ingress("default", "two", "two.example.com", &["b-tls"]));
        let (mut controller, service) = controller(store, dir.path());
        controller.update_haproxy().await.unwrap();
        let b_cert = cert_file_path(dir.path(), "default", "b-tls");
        assert!(b_cert.exists());

        controller.store_mut().delete_secret("default", "b-tls");
        controller
            .store_mut()
            .upsert_ingress(ingress("default", "two", "two.example.com", &[]));
        let report = controller.update_haproxy().await.unwrap();

        assert_eq!(report.action, Action::Reload);
        assert!(!b_cert.exists());
        assert!(cert_file_path(dir.path(), "default", "a-tls").exists());
        assert!(controller.configuration().https);
        assert_eq!(
            service.actions(),
            vec![ServiceAction::Reload, ServiceAction::Reload]
        );
    }

    #[tokio::test]
    async fn test_ingress_rule_changes_are_committed_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        let mut site = ingress("default", "site", "site.example.com", &[]);
        store.upsert_ingress(site.clone());
        let (mut controller, _) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();
        assert_eq!(report.action, Action::Reload);
        assert_eq!(controller.client().committed().routes, report.routes);
        assert!(controller.client().committed().rules.is_empty());

        site.annotations = Annotations::added(&values(&[("whitelist", "10.0.0.0/8")]));
        controller.store_mut().upsert_ingress(site);
        let report = controller.update_haproxy().await.unwrap();
        assert_eq!(report.action, Action::Reload);
        let committed = controller.client().committed();
        assert_eq!(committed.rules, report.rules);
        assert_eq!(committed.rules.rules(FRONTEND_HTTP).len(), 1);

        // same routes and rules again
        let report = controller.update_haproxy().await.unwrap();
        assert_eq!(report.action, Action::None);
    }

    #[tokio::test]
    async fn test_disabled_https_keeps_offload_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_secret(tls_secret("default", "site-tls"));
        store.upsert_ingress(ingress("default", "site", "site.example.com", &["site-tls"]));
        let mut settings = settings(dir.path());
        settings.https_port = None;
        let handlers = default_handlers(&settings);
        assert_eq!(handlers.len(), 2);
        let mut controller = Controller::new(
            store,
            MemoryClient::new(ProxyConfig::base()),
            Arc::new(RecordingService::default()),
            settings,
        );
        for handler in handlers {
            controller.register_handler(handler);
        }
        controller.handle_binds().unwrap();

        controller.update_haproxy().await.unwrap();

        assert!(!controller.configuration().https);
        let https = &controller.client().committed().frontends[FRONTEND_HTTPS];
        assert!(https.binds.iter().all(|b| !b.ssl));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_live_configuration_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_secret(tls_secret("default", "site-tls"));
        store.upsert_ingress(ingress("default", "site", "site.example.com", &["site-tls"]));
        let (mut controller, service) = controller(store, dir.path());
        let before = controller.client().committed().clone();

        controller.client_mut().reject_next_commit("disk full");
        let err = controller.update_haproxy().await.unwrap_err();

        assert!(matches!(err, Error::TransactionError(_)));
        assert!(err.is_retriable());
        assert_eq!(controller.client().committed(), &before);
        assert!(!controller.client().in_transaction());
        assert!(!controller.configuration().https);
        assert!(controller.configuration().ingress_routes.is_empty());
        assert!(service.actions().is_empty());
        let ingress = &controller.store().namespaces["default"].ingresses["site"];
        assert_eq!(ingress.status, Status::Added);

        // the next cycle applies the same delta
        let report = controller.update_haproxy().await.unwrap();
        assert_eq!(report.action, Action::Reload);
        assert!(https_offloaded(controller.client()));
    }

    #[tokio::test]
    async fn test_failed_start_aborts_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, service) = controller(new_store(&[]), dir.path());
        let commits = controller.client().commit_count();

        controller.client_mut().reject_next_start();
        assert!(controller.update_haproxy().await.is_err());
        assert_eq!(controller.client().commit_count(), commits);
        assert!(service.actions().is_empty());
    }

    #[tokio::test]
    async fn test_restart_wins_over_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_config_map(
            "haproxy",
            "config",
            &values(&[("nbthread", "4"), ("maxconn", "2000")]),
        );
        let (mut controller, service) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();

        assert_eq!(report.action, Action::Restart);
        assert_eq!(service.actions(), vec![ServiceAction::Restart]);
        let global = &controller.client().committed().global;
        assert_eq!(global.get("nbthread").map(String::as_str), Some("4"));
        assert_eq!(global.get("maxconn").map(String::as_str), Some("2000"));
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_hide_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, service) = controller(new_store(&[]), dir.path());
        controller.register_handler(Box::new(FailingHandler));

        let report = controller.update_haproxy().await.unwrap();

        assert_eq!(report.action, Action::Reload);
        assert_eq!(service.actions(), vec![ServiceAction::Reload]);
    }

    #[tokio::test]
    async fn test_default_backend_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_service(service("ns1", "fallback", &[8080, 9090]));
        store.upsert_config_map(
            "haproxy",
            "config",
            &values(&[("default-backend-service", "ns1/fallback")]),
        );
        let (mut controller, _) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();

        assert_eq!(report.routes.len(), 1);
        let route = &report.routes[0];
        assert_eq!(route.ingress, DEFAULT_SERVICE_INGRESS);
        assert_eq!(route.namespace, "ns1");
        assert_eq!(route.host, None);
        assert!(route.path.is_default_backend);
        assert_eq!(route.path.service_name, "fallback");
        assert_eq!(route.path.service_port, ServicePort::Number(8080));
    }

    #[tokio::test]
    async fn test_default_backend_service_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        for (whitelist, value) in [
            (vec![], "ns1"),
            (vec![], "ns1/"),
            (vec![], "ns1/missing"),
            (vec![], "a/b/c"),
            (vec!["other"], "ns1/fallback"),
        ] {
            let mut store = new_store(&whitelist);
            store.upsert_service(service("ns1", "fallback", &[8080]));
            store.upsert_service(service("ns1", "portless", &[]));
            let (mut controller, _) = controller_with_default(store, dir.path(), Some(value));

            let report = controller.update_haproxy().await.unwrap();
            assert!(report.routes.is_empty(), "{} should not resolve", value);
        }
    }

    #[tokio::test]
    async fn test_default_backend_service_without_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        store.upsert_service(service("ns1", "portless", &[]));
        let (mut controller, _) = controller_with_default(store, dir.path(), Some("ns1/portless"));

        let report = controller.update_haproxy().await.unwrap();
        assert!(report.routes.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_and_irrelevant_ingresses_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&["default"]);
        store.upsert_ingress(ingress("default", "kept", "kept.example.com", &[]));
        store.upsert_ingress(ingress("default", "gone", "gone.example.com", &[]));
        store.upsert_ingress(ingress("other", "ignored", "ignored.example.com", &[]));
        store.delete_ingress("default", "gone");
        let (mut controller, _) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();

        let hosts: Vec<_> = report
            .routes
            .iter()
            .filter_map(|r| r.host.as_deref())
            .collect();
        assert_eq!(hosts, vec!["kept.example.com"]);
        assert!(!controller.store().namespaces["default"]
            .ingresses
            .contains_key("gone"));
    }

    #[tokio::test]
    async fn test_ssl_passthrough_chain_follows_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(&[]);
        let mut passthrough = ingress("default", "tls", "tls.example.com", &[]);
        passthrough.annotations = Annotations::added(&values(&[("ssl-passthrough", "true")]));
        store.upsert_ingress(passthrough.clone());
        let (mut controller, _) = controller(store, dir.path());

        let report = controller.update_haproxy().await.unwrap();
        assert!(report.routes[0].ssl_passthrough);
        assert_eq!(report.action, Action::Reload);
        assert_eq!(
            report.rules.ssl_passthrough(),
            Some((FRONTEND_SSL, FRONTEND_HTTPS))
        );
        assert!(report
            .rules
            .rules(FRONTEND_SSL)
            .contains(&Rule::ReqInspectDelay { timeout_ms: 5000 }));
        assert!(controller.configuration().haproxy_rules.is_empty());
        assert!(controller.client().committed().frontends.contains_key(FRONTEND_SSL));
        assert!(!controller.configuration().ssl_passthrough);

        passthrough.annotations = Annotations::default();
        controller.store_mut().upsert_ingress(passthrough);
        let report = controller.update_haproxy().await.unwrap();
        assert!(!report.routes[0].ssl_passthrough);
        assert_eq!(report.action, Action::Reload);
        assert_eq!(report.rules.ssl_passthrough(), None);
        assert!(!controller.client().committed().frontends.contains_key(FRONTEND_SSL));
    }

    #[test]
    fn test_ssl_passthrough_precedence() {
        let mut store = new_store(&[]);
        store.upsert_config_map("haproxy", "config", &values(&[("ssl-passthrough", "false")]));
        let mut svc = service("default", "web", &[80]);
        svc.annotations = Annotations::added(&values(&[("ssl-passthrough", "false")]));
        store.upsert_service(svc);
        let mut ing = ingress("default", "site", "site.example.com", &[]);
        ing.annotations = Annotations::added(&values(&[("ssl-passthrough", "true")]));
        store.upsert_ingress(ing);

        let ns = &store.namespaces["default"];
        let ing = &ns.ingresses["site"];
        // service resolves: its annotation wins
        assert!(!ssl_passthrough_enabled(&store, ns, ing, &path("web")));
        // service missing: ingress wins over global
        assert!(ssl_passthrough_enabled(&store, ns, ing, &path("absent")));
    }

    #[test]
    fn test_ssl_passthrough_invalid_value_is_false() {
        let mut store = new_store(&[]);
        let mut ing = ingress("default", "site", "site.example.com", &[]);
        ing.annotations = Annotations::added(&values(&[("ssl-passthrough", "maybe")]));
        store.upsert_ingress(ing);

        let ns = &store.namespaces["default"];
        assert!(!ssl_passthrough_enabled(&store, ns, &ns.ingresses["site"], &path("web")));
    }

    #[test]
    fn test_ssl_passthrough_deleted_global_is_false() {
        let mut store = new_store(&[]);
        store.upsert_config_map("haproxy", "config", &values(&[("ssl-passthrough", "true")]));
        store.upsert_ingress(ingress("default", "site", "site.example.com", &[]));
        {
            let ns = &store.namespaces["default"];
            assert!(ssl_passthrough_enabled(&store, ns, &ns.ingresses["site"], &path("web")));
        }

        store.delete_config_map("haproxy", "config");
        let ns = &store.namespaces["default"];
        assert!(!ssl_passthrough_enabled(&store, ns, &ns.ingresses["site"], &path("web")));
    }
}
