//! Failure taxonomy shared by sessions, channels and the session cache

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credentials were rejected or the host could not be trusted. Never retried.
    #[error("authentication as {user}@{host} failed: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },
    /// The connection could not be established or went away.
    #[error("connection to {host} failed")]
    Connection {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("remote command `{command}` exited with status {exit_status}: {}", stderr.trim_end())]
    RemoteCommand {
        command: String,
        exit_status: u32,
        stderr: String,
    },
    /// Moving bytes to or from the remote side failed; the session is still usable.
    #[error("transfer of {path} failed")]
    Transfer {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("local I/O on {path:?} failed")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Only connection failures are worth another attempt, and only while creating a session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
    pub fn connection(host: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Connection {
            host: host.into(),
            source: source.into(),
        }
    }
    pub fn transfer(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Transfer {
            path: path.into(),
            source: source.into(),
        }
    }
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(Error::connection("login01", anyhow::anyhow!("reset")).is_retryable());
        let auth = Error::Authentication {
            user: "alice".into(),
            host: "login01".into(),
            reason: "password rejected".into(),
        };
        assert!(!auth.is_retryable());
        assert!(!Error::transfer("/data/a", anyhow::anyhow!("eof")).is_retryable());
    }
    #[test]
    fn chain_names_path_and_cause() {
        let error = Error::local_io(
            "/tmp/out/a.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied"),
        );
        let rendered = format!("{:#}", anyhow::Error::from(error));
        assert_eq!(
            rendered,
            "local I/O on \"/tmp/out/a.txt\" failed: permission denied"
        );
        let error = Error::RemoteCommand {
            command: "tar czf /tmp/x.tgz -C /data missing".into(),
            exit_status: 2,
            stderr: "tar: missing: No such file or directory\n".into(),
        };
        assert_eq!(
            error.to_string(),
            "remote command `tar czf /tmp/x.tgz -C /data missing` exited with status 2: \
             tar: missing: No such file or directory"
        );
    }
}
