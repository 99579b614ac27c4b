//! PID file handling and the `--health` liveness mode.

use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("reading pidfile {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("pidfile {path} does not contain a pid: {content:?}")]
    Malformed { path: String, content: String },
    #[error("process {0} is not running")]
    Dead(i32),
}

/// Write the current pid, mode 0600.
pub fn write_pidfile(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn remove_pidfile(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("removing pidfile {}: {}", path.display(), e);
        }
    }
}

/// Liveness check: read the pidfile and signal 0 the process.
pub fn check_alive(path: &Path) -> Result<i32, HealthError> {
    let content = std::fs::read_to_string(path).map_err(|source| HealthError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let pid: i32 = content
        .trim()
        .parse()
        .map_err(|_| HealthError::Malformed {
            path: path.display().to_string(),
            content: content.trim().to_string(),
        })?;

    #[cfg(unix)]
    {
        // Signal 0 performs the existence/permission check only.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return Err(HealthError::Dead(pid));
        }
        Ok(pid)
    }
    #[cfg(not(unix))]
    {
        Err(HealthError::Dead(pid))
    }
}
