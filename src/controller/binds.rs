//! Bind endpoints of the controller's frontends
//!
//! Bind names are positional: `bind_1` for IPv4, `bind_2` for IPv6. Callers
//! apply the computed list through bind edit operations keyed by that name.

use tracing::debug;

use crate::error::Result;
use crate::haproxy::{Bind, HaproxyClient};

pub const BIND_V4: &str = "bind_1";
pub const BIND_V6: &str = "bind_2";
pub const LOOPBACK_V4: &str = "127.0.0.1";
pub const LOOPBACK_V6: &str = "::1";

/// Enabled address families and their bind addresses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindSettings {
    pub ipv4: bool,
    pub ipv4_addr: String,
    pub ipv6: bool,
    pub ipv6_addr: String,
}

impl BindSettings {
    /// Loopback address used to reach the HTTPS frontend from the passthrough chain
    pub fn loopback(&self) -> &'static str {
        if self.ipv4 || !self.ipv6 {
            LOOPBACK_V4
        } else {
            LOOPBACK_V6
        }
    }
}

/// Ordered binds for a frontend listening on `port`
///
/// In passthrough mode the frontend only accepts chained connections: it
/// listens on loopback and expects the PROXY protocol header.
pub fn bind_list(settings: &BindSettings, port: u16, passthrough: bool) -> Vec<Bind> {
    let mut binds = Vec::with_capacity(2);
    if settings.ipv4 {
        binds.push(Bind {
            name: BIND_V4.to_string(),
            address: if passthrough {
                LOOPBACK_V4.to_string()
            } else {
                settings.ipv4_addr.clone()
            },
            port,
            accept_proxy: passthrough,
            ..Default::default()
        });
    }
    if settings.ipv6 {
        binds.push(Bind {
            name: BIND_V6.to_string(),
            address: if passthrough {
                LOOPBACK_V6.to_string()
            } else {
                settings.ipv6_addr.clone()
            },
            port,
            v4v6: true,
            accept_proxy: passthrough,
            ..Default::default()
        });
    }
    binds
}

/// Make the binds of `frontend` exactly `binds`: edit the ones that exist by
/// name, create the missing ones, delete the ones no longer wanted.
/// Returns whether anything changed.
pub fn reconcile_frontend_binds(
    api: &mut dyn HaproxyClient,
    frontend: &str,
    binds: &[Bind],
) -> Result<bool> {
    let current = api.frontend_binds(frontend)?;
    let mut changed = false;

    for bind in binds {
        match current.iter().find(|b| b.name == bind.name) {
            Some(existing) if existing == bind => {}
            Some(_) => {
                api.frontend_bind_edit(frontend, bind.clone())?;
                changed = true;
            }
            None => {
                api.frontend_bind_create(frontend, bind.clone())?;
                changed = true;
            }
        }
    }
    for stale in current
        .iter()
        .filter(|c| !binds.iter().any(|b| b.name == c.name))
    {
        debug!("Removing bind {} from frontend {}", stale.name, frontend);
        api.frontend_bind_delete(frontend, &stale.name)?;
        changed = true;
    }
    Ok(changed)
}
