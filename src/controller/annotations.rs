//! Annotation parsing and global (ConfigMap) annotation handling

use std::net::IpAddr;

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::haproxy::{HaproxyClient, Section};
use crate::store::{Status, Store};

/// Parse a boolean annotation the way Kubernetes users write them
pub fn get_bool_value(value: &str, annotation: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(Error::annotation(
            annotation,
            format!("invalid boolean value '{}'", other),
        )),
    }
}

/// Parse a duration into milliseconds. A bare number is milliseconds; the
/// units `us`, `ms`, `s`, `m`, `h` and `d` are accepted.
pub fn parse_time(value: &str) -> Result<i64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let invalid = || Error::annotation("duration", format!("invalid duration '{}'", value));

    let number: i64 = number.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "" | "ms" => Some(number),
        "us" => Some(number / 1000),
        "s" => number.checked_mul(1000),
        "m" => number.checked_mul(60_000),
        "h" => number.checked_mul(3_600_000),
        "d" => number.checked_mul(86_400_000),
        _ => None,
    };
    millis.ok_or_else(invalid)
}

/// Parse a comma separated list of IP addresses and CIDR blocks, dropping
/// (and logging) the invalid entries.
pub fn parse_source_list(value: &str, annotation: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let valid = is_ip_or_cidr(s);
            if !valid {
                error!("{} annotation: invalid address '{}'", annotation, s);
            }
            valid
        })
        .map(str::to_string)
        .collect()
}

fn is_ip_or_cidr(value: &str) -> bool {
    match value.split_once('/') {
        None => value.parse::<IpAddr>().is_ok(),
        Some((addr, prefix)) => match (addr.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(p)) => p <= 32,
            (Ok(IpAddr::V6(_)), Ok(p)) => p <= 128,
            _ => false,
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    Integer,
    Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effect {
    Reload,
    Restart,
}

struct GlobalOption {
    annotation: &'static str,
    section: Section,
    key: &'static str,
    kind: ValueKind,
    effect: Effect,
}

const GLOBAL_OPTIONS: &[GlobalOption] = &[
    GlobalOption {
        annotation: "maxconn",
        section: Section::Global,
        key: "maxconn",
        kind: ValueKind::Integer,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "nbthread",
        section: Section::Global,
        key: "nbthread",
        kind: ValueKind::Integer,
        effect: Effect::Restart,
    },
    GlobalOption {
        annotation: "hard-stop-after",
        section: Section::Global,
        key: "hard-stop-after",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-connect",
        section: Section::Defaults,
        key: "timeout connect",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-client",
        section: Section::Defaults,
        key: "timeout client",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-server",
        section: Section::Defaults,
        key: "timeout server",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-queue",
        section: Section::Defaults,
        key: "timeout queue",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-http-request",
        section: Section::Defaults,
        key: "timeout http-request",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
    GlobalOption {
        annotation: "timeout-http-keep-alive",
        section: Section::Defaults,
        key: "timeout http-keep-alive",
        kind: ValueKind::Duration,
        effect: Effect::Reload,
    },
];

impl GlobalOption {
    fn render(&self, value: &str) -> Result<String> {
        match self.kind {
            ValueKind::Integer => value
                .trim()
                .parse::<u64>()
                .map(|n| n.to_string())
                .map_err(|_| {
                    Error::annotation(self.annotation, format!("invalid integer '{}'", value))
                }),
            ValueKind::Duration => parse_time(value)
                .map(|ms| format!("{}ms", ms))
                .map_err(|_| {
                    Error::annotation(self.annotation, format!("invalid duration '{}'", value))
                }),
        }
    }
}

/// What global annotation changes require from the running proxy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalChanges {
    pub restart: bool,
    pub reload: bool,
}

/// Apply changed global annotations to the `global` and `defaults` sections
pub fn handle_global_annotations(store: &Store, api: &mut dyn HaproxyClient) -> GlobalChanges {
    let mut changes = GlobalChanges::default();
    let global = store.global_annotations();

    for option in GLOBAL_OPTIONS {
        let Some(value) = global.get(option.annotation) else {
            continue;
        };
        let rendered = match value.status {
            Status::Empty => continue,
            Status::Deleted => None,
            Status::Added | Status::Modified => match option.render(&value.value) {
                Ok(rendered) => Some(rendered),
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            },
        };

        if let Err(e) = api.option_write(option.section, option.key, rendered.as_deref()) {
            error!("Failed to apply annotation {}: {}", option.annotation, e);
            continue;
        }
        match &rendered {
            Some(v) => debug!("{} set to {}", option.key, v),
            None => debug!("{} unset", option.key),
        }
        match option.effect {
            Effect::Restart => {
                info!("Annotation {} changed, HAProxy restart required", option.annotation);
                changes.restart = true;
            }
            Effect::Reload => changes.reload = true,
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haproxy::{MemoryClient, ProxyConfig};
    use crate::store::NamespaceFilter;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("10s").unwrap(), 10_000);
        assert_eq!(parse_time("5000").unwrap(), 5_000);
        assert_eq!(parse_time("250ms").unwrap(), 250);
        assert_eq!(parse_time("2m").unwrap(), 120_000);
        assert_eq!(parse_time("1h").unwrap(), 3_600_000);
        assert_eq!(parse_time("1d").unwrap(), 86_400_000);
        assert_eq!(parse_time("1500us").unwrap(), 1);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("nope").is_err());
        assert!(parse_time("").is_err());
        assert!(parse_time("10x").is_err());
        assert!(parse_time("-5s").is_err());
    }

    #[test]
    fn test_bool_values() {
        assert!(get_bool_value("true", "ssl-passthrough").unwrap());
        assert!(get_bool_value("1", "ssl-passthrough").unwrap());
        assert!(!get_bool_value("False", "ssl-passthrough").unwrap());
        assert!(get_bool_value("yes", "ssl-passthrough").is_err());
    }

    #[test]
    fn test_source_list_drops_invalid_entries() {
        let sources = parse_source_list("10.0.0.0/8, 192.168.1.1,bogus, fd00::/129,::1", "whitelist");
        assert_eq!(sources, ["10.0.0.0/8", "192.168.1.1", "::1"]);
    }

    fn store_with_global(pairs: &[(&str, &str)]) -> Store {
        let mut store = Store::new(
            NamespaceFilter::default(),
            Some(("haproxy".to_string(), "config".to_string())),
        );
        let data: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        store.upsert_config_map("haproxy", "config", &data);
        store
    }

    #[test]
    fn test_global_annotations_reload_and_restart() {
        let store = store_with_global(&[("maxconn", "2000"), ("timeout-client", "10s")]);
        let mut client = MemoryClient::new(ProxyConfig::base());
        client.start_transaction().unwrap();

        let changes = handle_global_annotations(&store, &mut client);
        assert_eq!(
            changes,
            GlobalChanges {
                restart: false,
                reload: true
            }
        );
        client.commit_transaction().unwrap();
        assert_eq!(client.committed().global["maxconn"], "2000");
        assert_eq!(client.committed().defaults["timeout client"], "10000ms");

        let store = store_with_global(&[("nbthread", "4")]);
        client.start_transaction().unwrap();
        assert!(handle_global_annotations(&store, &mut client).restart);
    }

    #[test]
    fn test_unchanged_and_invalid_annotations_ignored() {
        let mut store = store_with_global(&[("maxconn", "lots")]);
        let mut client = MemoryClient::new(ProxyConfig::base());
        client.start_transaction().unwrap();
        assert_eq!(
            handle_global_annotations(&store, &mut client),
            GlobalChanges::default()
        );

        store.clean();
        assert_eq!(
            handle_global_annotations(&store, &mut client),
            GlobalChanges::default()
        );
    }

    #[test]
    fn test_deleted_annotation_unsets_option() {
        let mut store = store_with_global(&[("maxconn", "2000")]);
        let mut client = MemoryClient::new(ProxyConfig::base());
        client.start_transaction().unwrap();
        handle_global_annotations(&store, &mut client);
        client.commit_transaction().unwrap();

        store.clean();
        store.delete_config_map("haproxy", "config");
        client.start_transaction().unwrap();
        assert!(handle_global_annotations(&store, &mut client).reload);
        client.commit_transaction().unwrap();
        assert!(!client.committed().global.contains_key("maxconn"));
    }
}
