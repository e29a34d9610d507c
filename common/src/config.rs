use std::{env, path::PathBuf};

/// Address the client dials when nothing else is configured
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
/// Port the client dials when nothing else is configured
pub const DEFAULT_PORT: u16 = 4443;
/// Name the peer certificate must be issued for
pub const DEFAULT_SERVER_NAME: &str = "localhost";

const CERTS_DIR_ENV: &str = "LATCHKEY_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

fn get_certs_dir() -> PathBuf {
    env::var(CERTS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERTS_DIR))
}

/// Client certificate, key and trust anchor locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// Path to the client certificate (PEM)
    pub cert_path: PathBuf,
    /// Path to the client private key (PEM)
    pub key_path:  PathBuf,
    /// Path to the certificate authority bundle (PEM)
    pub ca_path:   PathBuf,
}

impl CredentialPaths {
    /// Creates CredentialPaths with default locations inside
    /// `$LATCHKEY_CERTS_DIR` (or `certs`)
    pub fn new() -> Self {
        Self::in_dir(get_certs_dir())
    }

    /// `client.pem`, `client.key.pem` and `root-ca.pem` inside `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let base = dir.into();
        Self {
            cert_path: base.join("client.pem"),
            key_path:  base.join("client.key.pem"),
            ca_path:   base.join("root-ca.pem"),
        }
    }

    /// Explicit file locations
    pub fn from_files(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path:  key_path.into(),
            ca_path:   ca_path.into(),
        }
    }
}

impl Default for CredentialPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Server certificate, key and client trust anchor locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCredentialPaths {
    /// Path to the server certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Path to the server private key (PEM)
    pub key_path:  PathBuf,
    /// Path to the CA that issues client certificates (PEM)
    pub ca_path:   PathBuf,
}

impl ServerCredentialPaths {
    /// Creates ServerCredentialPaths with default locations inside
    /// `$LATCHKEY_CERTS_DIR` (or `certs`)
    pub fn new() -> Self {
        Self::in_dir(get_certs_dir())
    }

    /// `server.pem`, `server.key.pem` and `root-ca.pem` inside `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let base = dir.into();
        Self {
            cert_path: base.join("server.pem"),
            key_path:  base.join("server.key.pem"),
            ca_path:   base.join("root-ca.pem"),
        }
    }

    pub fn from_files(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path:  key_path.into(),
            ca_path:   ca_path.into(),
        }
    }
}

impl Default for ServerCredentialPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_layout() {
        let paths = CredentialPaths::in_dir("/etc/latchkey");
        assert_eq!(paths.cert_path, PathBuf::from("/etc/latchkey/client.pem"));
        assert_eq!(paths.key_path, PathBuf::from("/etc/latchkey/client.key.pem"));
        assert_eq!(paths.ca_path, PathBuf::from("/etc/latchkey/root-ca.pem"));

        let server = ServerCredentialPaths::in_dir("/etc/latchkey");
        assert_eq!(server.cert_path, PathBuf::from("/etc/latchkey/server.pem"));
        assert_eq!(server.ca_path, paths.ca_path);
    }
}
