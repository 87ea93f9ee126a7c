//! Filesystem environment HAProxy runs in
//!
//! Any failure here is fatal: the controller cannot drive a proxy whose
//! binary, base configuration or working directories are missing.

use std::fs;
use std::path::Path;

use tracing::{debug, error};

use crate::config::{ControllerConfig, Paths};
use crate::error::{Error, Result};

/// Name of the server-state file HAProxy expects in the state directory
pub const SERVER_STATE_FILE: &str = "global";

fn create_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path).map_err(|e| {
        Error::InitializationError(format!("cannot create {}: {}", path.display(), e))
    })
}

/// Check the HAProxy binary and base configuration, and create the working
/// directories. Returns the resolved layout.
pub fn initialize(config: &ControllerConfig) -> Result<Paths> {
    let paths = config.paths();

    if !paths.program.exists() && !config.test {
        return Err(Error::InitializationError(format!(
            "HAProxy binary {} not found",
            paths.program.display()
        )));
    }
    if !paths.cfg_file.exists() {
        return Err(Error::InitializationError(format!(
            "HAProxy configuration {} not found",
            paths.cfg_file.display()
        )));
    }

    if let Some(dir) = &paths.transaction_dir {
        create_dir(dir)?;
    }
    for dir in [
        &paths.cert_dir,
        &paths.map_dir,
        &paths.errorfile_dir,
        &paths.state_dir,
    ] {
        create_dir(dir)?;
        debug!("Directory {} ready", dir.display());
    }

    let state_file = paths.state_dir.join(SERVER_STATE_FILE);
    if let Err(e) = fs::File::create(&state_file) {
        error!("Cannot create {}: {}", state_file.display(), e);
    }

    Ok(paths)
}
