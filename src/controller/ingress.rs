//! Ingress-scoped annotations turned into frontend rules
//!
//! Values resolve with ingress > global precedence. Rules are rebuilt every
//! cycle, so nothing here tracks what was applied before.

use tracing::error;

use super::annotations::{get_bool_value, parse_source_list};
use crate::haproxy::rules::{HaproxyRules, Rule};
use crate::haproxy::{FRONTEND_HTTP, FRONTEND_HTTPS};
use crate::store::{get_value_from_annotations, Ingress, Store};

pub const ANN_WHITELIST: &str = "whitelist";
pub const ANN_SSL_REDIRECT: &str = "ssl-redirect";
pub const ANN_SSL_REDIRECT_CODE: &str = "ssl-redirect-code";
const DEFAULT_REDIRECT_CODE: u16 = 302;

fn ingress_hosts(ingress: &Ingress) -> Vec<String> {
    let mut hosts: Vec<String> = ingress
        .rules
        .iter()
        .filter(|r| !r.host.is_empty())
        .map(|r| r.host.clone())
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

fn resolve<'a>(store: &'a Store, ingress: &'a Ingress, name: &str) -> Option<&'a str> {
    get_value_from_annotations(name, &[&ingress.annotations, store.global_annotations()])
        .filter(|v| !v.is_deleted())
        .map(|v| v.value.as_str())
}

pub fn handle_ingress_annotations(store: &Store, ingress: &Ingress, rules: &mut HaproxyRules) {
    let hosts = ingress_hosts(ingress);

    if let Some(value) = resolve(store, ingress, ANN_WHITELIST) {
        let sources = parse_source_list(value, ANN_WHITELIST);
        if !sources.is_empty() {
            for frontend in [FRONTEND_HTTP, FRONTEND_HTTPS] {
                let rule = Rule::ReqDenyUnlessSource {
                    hosts: hosts.clone(),
                    sources: sources.clone(),
                };
                if let Err(e) = rules.add_rule(rule, frontend) {
                    error!("Ingress {}/{}: {}", ingress.namespace, ingress.name, e);
                }
            }
        }
    }

    let redirect = match resolve(store, ingress, ANN_SSL_REDIRECT) {
        Some(value) => get_bool_value(value, ANN_SSL_REDIRECT).unwrap_or_else(|e| {
            error!("Ingress {}/{}: {}", ingress.namespace, ingress.name, e);
            false
        }),
        None => false,
    };
    if redirect {
        let code = resolve(store, ingress, ANN_SSL_REDIRECT_CODE)
            .map(|v| match v.trim().parse::<u16>() {
                Ok(code) => code,
                Err(_) => {
                    error!(
                        "Ingress {}/{}: {} annotation: invalid code '{}'",
                        ingress.namespace, ingress.name, ANN_SSL_REDIRECT_CODE, v
                    );
                    DEFAULT_REDIRECT_CODE
                }
            })
            .unwrap_or(DEFAULT_REDIRECT_CODE);
        let rule = Rule::RedirectScheme { hosts, code };
        if let Err(e) = rules.add_rule(rule, FRONTEND_HTTP) {
            error!("Ingress {}/{}: {}", ingress.namespace, ingress.name, e);
        }
    }
}
