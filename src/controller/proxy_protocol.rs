//! Accept the PROXY protocol from trusted sources on the HTTP(S) frontends

use tracing::debug;

use super::annotations::parse_source_list;
use super::configuration::Configuration;
use super::handler::{HandlerOutcome, UpdateHandler};
use crate::haproxy::rules::Rule;
use crate::haproxy::{HaproxyClient, FRONTEND_HTTP, FRONTEND_HTTPS};
use crate::store::{Status, Store};

pub const ANN_PROXY_PROTOCOL: &str = "proxy-protocol";

#[derive(Clone, Debug, Default)]
pub struct ProxyProtocol;

impl UpdateHandler for ProxyProtocol {
    fn name(&self) -> &'static str {
        "proxy-protocol"
    }

    fn update(
        &self,
        store: &Store,
        cfg: &mut Configuration,
        _api: &mut dyn HaproxyClient,
    ) -> HandlerOutcome {
        let Some(value) = store.global_annotations().get(ANN_PROXY_PROTOCOL) else {
            return HandlerOutcome::default();
        };
        let mut outcome = HandlerOutcome::reload(value.status != Status::Empty);
        if value.is_deleted() {
            debug!("proxy-protocol disabled");
            return outcome;
        }

        let sources = parse_source_list(&value.value, ANN_PROXY_PROTOCOL);
        if sources.is_empty() {
            return outcome;
        }
        for frontend in [FRONTEND_HTTP, FRONTEND_HTTPS] {
            let rule = Rule::ReqProxyProtocol {
                sources: sources.clone(),
            };
            if let Err(e) = cfg.haproxy_rules.add_rule(rule, frontend) {
                outcome.push_error(e);
            }
        }
        outcome
    }
}
