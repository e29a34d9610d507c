use std::fmt;

use sha2::{Digest, Sha256};

/// Diagnostic summary of the certificate a peer presented. Informational
/// only: verification already happened during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub subject:     String,
    pub issuer:      String,
    /// Lowercase hex SHA-256 of the DER certificate
    pub fingerprint: String,
}

impl PeerIdentity {
    /// Returns `None` when the bytes are not a parsable X.509 certificate
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
        Some(Self {
            subject:     cert.subject().to_string(),
            issuer:      cert.issuer().to_string(),
            fingerprint: hex::encode(Sha256::digest(der)),
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject=[{}] issuer=[{}] sha256={}",
            self.subject, self.issuer, self.fingerprint
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::tls_context::load_certificates;

    #[test]
    fn test_identity_of_fixture_server() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/server.pem");
        let cert = load_certificates(&path).unwrap().remove(0);

        let identity = PeerIdentity::from_der(cert.as_ref()).unwrap();
        assert!(identity.subject.contains("localhost"), "{}", identity.subject);
        assert!(identity.issuer.contains("latchkey test root"), "{}", identity.issuer);
        assert_eq!(identity.fingerprint.len(), 64);
    }

    #[test]
    fn test_garbage_is_not_an_identity() {
        assert!(PeerIdentity::from_der(b"definitely not DER").is_none());
    }
}
