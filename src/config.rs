//! Controller configuration
//!
//! Built by the binary from command-line flags and environment variables;
//! defaults mirror the layout of the HAProxy container image.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::controller::binds::BindSettings;
use crate::error::{Error, Result};
use crate::store::NamespaceFilter;

pub const DEFAULT_HAPROXY_BINARY: &str = "/usr/local/sbin/haproxy";
pub const DEFAULT_CFG_DIR: &str = "/etc/haproxy";
pub const DEFAULT_STATE_DIR: &str = "/var/state/haproxy/";
pub const DEFAULT_RUNTIME_SOCKET: &str = "/var/run/haproxy-runtime-api.sock";
pub const DEFAULT_PID_FILE: &str = "/var/run/haproxy.pid";
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Skip checks and process control that need a real HAProxy
    pub test: bool,
    pub program: Option<PathBuf>,
    pub cfg_dir: PathBuf,
    pub cfg_file: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub map_dir: Option<PathBuf>,
    pub errorfile_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub runtime_socket: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub transaction_dir: Option<PathBuf>,

    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    pub ipv4_bind_addr: String,
    pub ipv6_bind_addr: String,
    pub disable_http: bool,
    pub disable_https: bool,
    pub http_bind_port: u16,
    pub https_bind_port: u16,

    /// `namespace/service` used when no ConfigMap annotation overrides it
    pub default_backend_service: Option<String>,
    /// `namespace/name` of the ConfigMap holding global annotations
    pub configmap: Option<String>,
    pub namespace_whitelist: Vec<String>,
    pub namespace_blacklist: Vec<String>,

    /// Capacity of the sync event queue
    pub queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            test: false,
            program: None,
            cfg_dir: PathBuf::from(DEFAULT_CFG_DIR),
            cfg_file: None,
            cert_dir: None,
            map_dir: None,
            errorfile_dir: None,
            state_dir: None,
            runtime_socket: None,
            pid_file: None,
            transaction_dir: None,
            disable_ipv4: false,
            disable_ipv6: false,
            ipv4_bind_addr: "0.0.0.0".to_string(),
            ipv6_bind_addr: "::".to_string(),
            disable_http: false,
            disable_https: false,
            http_bind_port: DEFAULT_HTTP_PORT,
            https_bind_port: DEFAULT_HTTPS_PORT,
            default_backend_service: None,
            configmap: None,
            namespace_whitelist: Vec::new(),
            namespace_blacklist: Vec::new(),
            queue_capacity: 600,
        }
    }
}

/// Fully resolved filesystem layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    pub program: PathBuf,
    pub cfg_file: PathBuf,
    pub cert_dir: PathBuf,
    pub map_dir: PathBuf,
    pub errorfile_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runtime_socket: PathBuf,
    pub pid_file: PathBuf,
    pub transaction_dir: Option<PathBuf>,
}

impl ControllerConfig {
    pub fn paths(&self) -> Paths {
        let cfg_dir = &self.cfg_dir;
        Paths {
            program: self
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HAPROXY_BINARY)),
            cfg_file: self
                .cfg_file
                .clone()
                .unwrap_or_else(|| cfg_dir.join("haproxy.cfg")),
            cert_dir: self
                .cert_dir
                .clone()
                .unwrap_or_else(|| cfg_dir.join("certs")),
            map_dir: self.map_dir.clone().unwrap_or_else(|| cfg_dir.join("maps")),
            errorfile_dir: self
                .errorfile_dir
                .clone()
                .unwrap_or_else(|| cfg_dir.join("errors")),
            state_dir: self
                .state_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            runtime_socket: self
                .runtime_socket
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_SOCKET)),
            pid_file: self
                .pid_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
            transaction_dir: self.transaction_dir.clone(),
        }
    }

    pub fn bind_settings(&self) -> BindSettings {
        BindSettings {
            ipv4: !self.disable_ipv4,
            ipv4_addr: self.ipv4_bind_addr.clone(),
            ipv6: !self.disable_ipv6,
            ipv6_addr: self.ipv6_bind_addr.clone(),
        }
    }

    pub fn namespace_filter(&self) -> NamespaceFilter {
        NamespaceFilter {
            whitelist: self.namespace_whitelist.iter().cloned().collect::<BTreeSet<_>>(),
            blacklist: self.namespace_blacklist.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }

    /// The main ConfigMap as `(namespace, name)`
    pub fn main_config_map(&self) -> Result<Option<(String, String)>> {
        let Some(value) = self.configmap.as_deref() else {
            return Ok(None);
        };
        match value.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Some((ns.to_string(), name.to_string())))
            }
            _ => Err(Error::ConfigError(format!(
                "configmap must be 'namespace/name', got '{}'",
                value
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.disable_ipv4 && self.disable_ipv6 {
            return Err(Error::ConfigError(
                "at least one of IPv4 and IPv6 must be enabled".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        self.main_config_map()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_follow_cfg_dir() {
        let config = ControllerConfig {
            cfg_dir: PathBuf::from("/tmp/haproxy"),
            ..Default::default()
        };
        let paths = config.paths();
        assert_eq!(paths.cfg_file, PathBuf::from("/tmp/haproxy/haproxy.cfg"));
        assert_eq!(paths.cert_dir, PathBuf::from("/tmp/haproxy/certs"));
        assert_eq!(paths.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(paths.transaction_dir, None);
    }

    #[test]
    fn test_main_config_map_parsing() {
        let mut config = ControllerConfig {
            configmap: Some("haproxy/haproxy-config".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.main_config_map().unwrap(),
            Some(("haproxy".to_string(), "haproxy-config".to_string()))
        );

        config.configmap = Some("haproxy-config".to_string());
        assert!(config.main_config_map().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_both_families_disabled_is_invalid() {
        let config = ControllerConfig {
            disable_ipv4: true,
            disable_ipv6: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
