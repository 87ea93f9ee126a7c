//! Certificate files backing TLS offload
//!
//! Every TLS secret referenced by an ingress is written to the certificate
//! directory as `<namespace>_<name>.pem` (certificate followed by key). Files
//! not referenced during the current cycle are removed afterwards.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::store::{Ingress, IngressTls, Status, Store};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY: &str = "tls.key";

pub fn cert_file_path(cert_dir: &Path, namespace: &str, name: &str) -> PathBuf {
    cert_dir.join(format!("{}_{}.pem", namespace, name))
}

/// Split a secret reference into `(namespace, name)`; bare names live in the
/// ingress namespace.
fn secret_ref<'a>(ingress: &'a Ingress, reference: &'a str) -> (&'a str, &'a str) {
    match reference.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => (ns, name),
        _ => (ingress.namespace.as_str(), reference),
    }
}

/// Write the certificate of a TLS binding and mark it used.
/// Returns whether a certificate file was created or changed.
pub fn handle_tls_secret(
    store: &Store,
    ingress: &Ingress,
    tls: &IngressTls,
    cert_dir: &Path,
    used_certs: &mut BTreeSet<PathBuf>,
) -> bool {
    let (namespace, name) = secret_ref(ingress, &tls.secret_name);
    let secret = match store
        .namespaces
        .get(namespace)
        .and_then(|ns| ns.secrets.get(name))
    {
        Some(secret) if secret.status != Status::Deleted => secret,
        _ => {
            warn!(
                "Ingress {}/{}: secret {}/{} not found",
                ingress.namespace, ingress.name, namespace, name
            );
            return false;
        }
    };

    let (Some(crt), Some(key)) = (
        secret.data.get(TLS_CERT_KEY),
        secret.data.get(TLS_PRIVATE_KEY),
    ) else {
        warn!(
            "Ingress {}/{}: secret {}/{} lacks {} or {}",
            ingress.namespace, ingress.name, namespace, name, TLS_CERT_KEY, TLS_PRIVATE_KEY
        );
        return false;
    };

    let mut pem = crt.clone();
    if !pem.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend_from_slice(key);

    let path = cert_file_path(cert_dir, namespace, name);
    if fs::read(&path).map(|current| current == pem).unwrap_or(false) {
        used_certs.insert(path);
        return false;
    }
    match fs::write(&path, &pem) {
        Ok(()) => {
            info!("Certificate {} updated", path.display());
            used_certs.insert(path);
            true
        }
        Err(e) => {
            warn!("Failed to write certificate {}: {}", path.display(), e);
            // an older version on disk keeps serving
            if path.is_file() {
                used_certs.insert(path);
            }
            false
        }
    }
}

/// Remove every regular file of `cert_dir` that is not in `used_certs`.
/// Directories are left alone; a file that cannot be removed is skipped.
/// Returns whether a file was removed.
pub fn clean_cert_dir(cert_dir: &Path, used_certs: &BTreeSet<PathBuf>) -> Result<bool> {
    let mut removed = false;
    for entry in fs::read_dir(cert_dir)? {
        let Ok(entry) = entry else { continue };
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        let path = cert_dir.join(entry.file_name());
        if !used_certs.contains(&path) && fs::remove_file(&path).is_ok() {
            info!("Removed unused certificate {}", path.display());
            removed = true;
        }
    }
    Ok(removed)
}
