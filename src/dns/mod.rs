//! dnsmasq integration
//!
//! dnsmasq resolves the tunneled domains and, through `ipset=` directives,
//! inserts every answer into the kernel set. This module owns the directive
//! file, the pinned hosts file and the validation of what goes into them.

pub mod directives;
pub mod hosts;

pub use directives::DirectiveFile;
pub use hosts::HostsFile;

use crate::error::{Store, StoreError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Trim, lowercase and strip one trailing dot, then validate as a hostname
pub fn normalize_domain(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    let domain = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();
    let invalid = |reason: &str| StoreError::invalid(Store::DirectiveFile, "domain", raw, reason);

    if domain.is_empty() {
        return Err(invalid("empty"));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("longer than 253 bytes"));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label longer than 63 bytes"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("only ASCII letters, digits, '-' and '_' are allowed"));
        }
    }
    Ok(domain)
}

/// Normalize a list, dropping duplicates while keeping first-seen order
pub fn normalize_domains<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, StoreError> {
    let mut domains: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let domain = normalize_domain(item.as_ref())?;
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    Ok(domains)
}

fn io_error(store: Store, path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        store,
        path: path.to_path_buf(),
        source,
    }
}

/// Non-blank lines of a dnsmasq file; a missing file reads as empty
pub(crate) fn read_lines(store: Store, path: &Path) -> Result<Vec<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_error(store, path, e)),
    }
}

/// Replace the file with `lines`, or delete it when there are none.
///
/// Content goes to a sibling temporary file which is then renamed over the
/// original, so a dnsmasq reload never sees a half-written file.
pub(crate) fn write_lines(store: Store, path: &Path, lines: &[String]) -> Result<(), StoreError> {
    if lines.is_empty() {
        return match fs::remove_file(path) {
            Ok(()) => {
                info!("Removed empty file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(store, path, e)),
        };
    }

    let mut content = lines.join("\n");
    content.push('\n');

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| io_error(store, &dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_error(store, &dir, e))?;
    tmp.write_all(content.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| io_error(store, tmp.path(), e))?;

    // dnsmasq drops privileges after start; the file must stay world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| io_error(store, tmp.path(), e))?;
    }

    tmp.persist(path)
        .map_err(|e| io_error(store, path, e.error))?;
    Ok(())
}
