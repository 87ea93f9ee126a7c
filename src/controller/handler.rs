//! Extension handlers invoked once per sync cycle
//!
//! Handlers run inside the cycle's open transaction, after the ingress walk
//! and before the commit. They must not open a transaction of their own, must
//! be idempotent, and must not rely on side effects of other handlers.

use crate::error::Error;
use crate::haproxy::HaproxyClient;
use crate::store::Store;

use super::configuration::Configuration;

/// Result of one handler invocation. Errors never hide `reload`: the engine
/// honours the reload request of a handler that also failed.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub reload: bool,
    pub errors: Vec<Error>,
}

impl HandlerOutcome {
    pub fn reload(reload: bool) -> Self {
        Self {
            reload,
            errors: Vec::new(),
        }
    }

    pub fn push_error<E: Into<Error>>(&mut self, error: E) {
        self.errors.push(error.into());
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub trait UpdateHandler: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn update(
        &self,
        store: &Store,
        cfg: &mut Configuration,
        api: &mut dyn HaproxyClient,
    ) -> HandlerOutcome;
}
