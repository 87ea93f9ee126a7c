//! Low-level proxy rules accumulated during a sync cycle
//!
//! Rules are declarative: every cycle rebuilds the whole set, so adding the
//! same rule twice to a frontend keeps a single copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Redirect codes HAProxy accepts for `redirect scheme`
pub const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Rule {
    /// `tcp-request content accept if { req_ssl_hello_type 1 }`
    ReqAcceptContent,
    /// `tcp-request content set-var(<scope>.<name>) <expression>`
    ReqSetVar {
        name: String,
        scope: String,
        expression: String,
    },
    /// `tcp-request inspect-delay <timeout_ms>`
    ReqInspectDelay { timeout_ms: i64 },
    /// Deny requests for `hosts` unless the client address is in `sources`
    ReqDenyUnlessSource {
        hosts: Vec<String>,
        sources: Vec<String>,
    },
    /// `redirect scheme https code <code>` for `hosts`
    RedirectScheme { hosts: Vec<String>, code: u16 },
    /// `tcp-request connection expect-proxy layer4` for `sources`
    ReqProxyProtocol { sources: Vec<String> },
}

impl Rule {
    fn validate(&self) -> Result<()> {
        match self {
            Rule::ReqSetVar {
                name, expression, ..
            } if name.is_empty() || expression.is_empty() => Err(Error::InvalidRule(
                "set-var requires a variable name and an expression".to_string(),
            )),
            Rule::ReqInspectDelay { timeout_ms } if *timeout_ms < 0 => Err(Error::InvalidRule(
                format!("inspect-delay timeout must not be negative, got {}", timeout_ms),
            )),
            Rule::ReqDenyUnlessSource { sources, .. } | Rule::ReqProxyProtocol { sources }
                if sources.is_empty() =>
            {
                Err(Error::InvalidRule("source list is empty".to_string()))
            }
            Rule::RedirectScheme { code, .. } if !REDIRECT_CODES.contains(code) => Err(
                Error::InvalidRule(format!("unsupported redirect code {}", code)),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaproxyRules {
    frontends: BTreeMap<String, Vec<Rule>>,
    /// Passthrough chaining: TCP frontend -> TLS-terminating frontend
    ssl_passthrough: Option<(String, String)>,
}

impl HaproxyRules {
    pub fn add_rule(&mut self, rule: Rule, frontend: &str) -> Result<()> {
        rule.validate()?;
        let rules = self.frontends.entry(frontend.to_string()).or_default();
        if !rules.contains(&rule) {
            rules.push(rule);
        }
        Ok(())
    }

    pub fn enable_ssl_passthrough(&mut self, frontend: &str, target_frontend: &str) {
        self.ssl_passthrough = Some((frontend.to_string(), target_frontend.to_string()));
    }

    pub fn ssl_passthrough(&self) -> Option<(&str, &str)> {
        self.ssl_passthrough
            .as_ref()
            .map(|(from, to)| (from.as_str(), to.as_str()))
    }

    pub fn rules(&self, frontend: &str) -> &[Rule] {
        self.frontends
            .get(frontend)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.frontends.values().all(Vec::is_empty) && self.ssl_passthrough.is_none()
    }

    pub fn clean(&mut self) {
        self.frontends.clear();
        self.ssl_passthrough = None;
    }
}
