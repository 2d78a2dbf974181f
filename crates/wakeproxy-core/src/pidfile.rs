use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::error::WakeproxyError;

/// The pid-file contract shared between the running supervisor and the
/// `wakeproxy healthcheck` CLI: an ASCII `<pid>`, or `<pid>:<health-check-url>`
/// once the backend has reported healthy. The URL suffix is how an external
/// health check (e.g. a container orchestrator) learns the backend is
/// actually ready rather than just "a supervisor process exists".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFileContents {
    pub pid: u32,
    pub health_check_url: Option<Url>,
}

/// Owns the pid-file path and writes the supervisor's own pid into it,
/// with an optional health-check URL suffix.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the supervisor's own pid, replacing any previous contents.
    /// `health_check_url` should be `Some` only while the backend is
    /// reachable and healthy.
    pub fn write(&self, health_check_url: Option<&Url>) -> Result<(), WakeproxyError> {
        let pid = std::process::id();
        let mut contents = pid.to_string();
        if let Some(url) = health_check_url {
            contents.push(':');
            contents.push_str(url.as_str());
        }
        fs::write(&self.path, contents)
            .map_err(|e| WakeproxyError::pid_file(self.path.clone(), e))?;
        debug!(path = %self.path.display(), healthy = health_check_url.is_some(), "wrote pid file");
        Ok(())
    }

    /// Best-effort removal; a missing file is not an error since the
    /// process may never have written one (or another run already cleaned
    /// it up).
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove pid file");
            }
        }
    }

    /// Reads and parses an existing pid file, used by the standalone
    /// health-check entry point to decide whether the supervisor (and, if
    /// present, its backend) is alive.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<PidFileContents>, WakeproxyError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WakeproxyError::pid_file(path.to_path_buf(), e)),
        };
        parse_pid_file(&raw).map(Some)
    }
}

fn parse_pid_file(raw: &str) -> Result<PidFileContents, WakeproxyError> {
    let raw = raw.trim();
    let (pid_part, url_part) = match raw.split_once(':') {
        Some((pid, url)) => (pid, Some(url)),
        None => (raw, None),
    };

    let pid: u32 = pid_part.parse().map_err(|_| {
        WakeproxyError::PidFile {
            path: PathBuf::new(),
            message: format!("pid file did not start with a number: {pid_part:?}"),
        }
    })?;

    let health_check_url = url_part
        .map(Url::parse)
        .transpose()
        .map_err(|e| WakeproxyError::PidFile {
            path: PathBuf::new(),
            message: format!("invalid health check URL in pid file: {e}"),
        })?;

    Ok(PidFileContents {
        pid,
        health_check_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_back_pid_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakeproxy.pid");
        let pid_file = PidFile::new(&path);

        pid_file.write(None).unwrap();
        let contents = PidFile::read(&path).unwrap().unwrap();
        assert_eq!(contents.pid, std::process::id());
        assert_eq!(contents.health_check_url, None);
    }

    #[test]
    fn writes_and_reads_back_pid_with_health_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakeproxy.pid");
        let pid_file = PidFile::new(&path);
        let url = Url::parse("http://127.0.0.1:3000/health").unwrap();

        pid_file.write(Some(&url)).unwrap();
        let contents = PidFile::read(&path).unwrap().unwrap();
        assert_eq!(contents.pid, std::process::id());
        assert_eq!(contents.health_check_url, Some(url));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.pid");
        assert_eq!(PidFile::read(&path).unwrap(), None);
    }

    #[test]
    fn remove_is_a_no_op_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.pid");
        PidFile::new(&path).remove();
    }
}
