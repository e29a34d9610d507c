//! Client TLS context: credentials, trust anchors and the peer verifier.

use std::{
    fs,
    io::{self, BufReader},
    path::Path,
    sync::{Arc, Once},
};

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use tracing::{debug, info, warn};

use crate::{config::CredentialPaths, error::ConfigError};

/// Only the immediate issuer of the peer certificate may be a trust anchor
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 1;

static CRYPTO_PROVIDER: Once = Once::new();

/// Installs the process-wide rustls crypto provider. Runs once per process;
/// later calls are no-ops.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Crypto provider already installed by another component");
        }
    });
}

/// Reads every certificate in a PEM file
pub fn load_certificates(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)?;
    let chain = certs(&mut BufReader::new(&*pem)).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }
    Ok(chain)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path)?;
    private_key(&mut BufReader::new(&*pem))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}

/// An immutable client configuration ready to be shared by connections
#[derive(Clone)]
pub struct TlsContext {
    config:          Arc<ClientConfig>,
    max_chain_depth: usize,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("max_chain_depth", &self.max_chain_depth)
            .field("client_auth", &self.presents_client_certificate())
            .finish()
    }
}

impl TlsContext {
    /// Builds a context that presents the client certificate and only
    /// accepts peers whose chain fits within `max_chain_depth`.
    pub fn build(paths: &CredentialPaths, max_chain_depth: usize) -> Result<Self, ConfigError> {
        ensure_crypto_provider();
        let max_chain_depth = max_chain_depth.max(1);

        debug!("Loading client credentials:");
        debug!("  - Client cert: {:?}", paths.cert_path);
        debug!("  - Client key: {:?}", paths.key_path);
        debug!("  - CA cert: {:?}", paths.ca_path);

        let cert_load = |path: &Path, err: io::Error| ConfigError::CertificateLoad {
            path:   path.to_path_buf(),
            reason: err.to_string(),
        };
        let cert_chain =
            load_certificates(&paths.cert_path).map_err(|e| cert_load(&paths.cert_path, e))?;
        let key = load_private_key(&paths.key_path).map_err(|e| cert_load(&paths.key_path, e))?;

        let anchor_load = |reason: String| ConfigError::TrustAnchorLoad {
            path: paths.ca_path.clone(),
            reason,
        };
        let anchors = load_certificates(&paths.ca_path).map_err(|e| anchor_load(e.to_string()))?;

        let mut root_store = RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(anchors.iter().cloned());
        if ignored > 0 {
            warn!("Ignored {} unusable CA certificate(s) in {:?}", ignored, paths.ca_path);
        }
        if added == 0 {
            return Err(anchor_load("no valid CA certificates found".into()));
        }

        let inner = WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| anchor_load(e.to_string()))?;
        let verifier = Arc::new(DepthLimitedVerifier {
            inner,
            anchors,
            max_depth: max_chain_depth,
        });

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| ConfigError::CertificateLoad {
                path:   paths.key_path.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "TLS client context ready ({} trust anchor(s), max chain depth {})",
            added, max_chain_depth
        );

        Ok(Self {
            config: Arc::new(config),
            max_chain_depth,
        })
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn max_chain_depth(&self) -> usize {
        self.max_chain_depth
    }

    /// Whether a client certificate will be offered when the peer asks
    pub fn presents_client_certificate(&self) -> bool {
        self.config.client_auth_cert_resolver.has_certs()
    }
}

/// WebPKI verification plus a cap on how many issuers may sit between the
/// peer certificate and a trust anchor.
///
/// Depth counts certificates above the leaf: depth 1 means the leaf must be
/// signed directly by a trust anchor.
#[derive(Debug)]
struct DepthLimitedVerifier {
    inner:     Arc<WebPkiServerVerifier>,
    anchors:   Vec<CertificateDer<'static>>,
    max_depth: usize,
}

impl DepthLimitedVerifier {
    fn non_anchor_issuers(&self, intermediates: &[CertificateDer<'_>]) -> usize {
        intermediates
            .iter()
            .filter(|cert| {
                !self
                    .anchors
                    .iter()
                    .any(|anchor| anchor.as_ref() == cert.as_ref())
            })
            .count()
    }
}

impl ServerCertVerifier for DepthLimitedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let issuers = self.non_anchor_issuers(intermediates);
        if issuers >= self.max_depth {
            warn!(
                "Peer chain needs {} intermediate issuer(s); max chain depth is {}",
                issuers, self.max_depth
            );
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    fn fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
    }

    #[test]
    fn test_build_with_valid_credentials() {
        let ctx = TlsContext::build(&CredentialPaths::in_dir(fixtures()), 1).unwrap();
        assert_eq!(ctx.max_chain_depth(), 1);
        assert!(ctx.presents_client_certificate());
    }

    #[test]
    fn test_zero_depth_is_clamped() {
        let ctx = TlsContext::build(&CredentialPaths::in_dir(fixtures()), 0).unwrap();
        assert_eq!(ctx.max_chain_depth(), 1);
    }

    #[test]
    fn test_missing_certificate() {
        let mut paths = CredentialPaths::in_dir(fixtures());
        paths.cert_path = fixtures().join("does-not-exist.pem");
        let err = TlsContext::build(&paths, 1).unwrap_err();
        assert!(matches!(err, ConfigError::CertificateLoad { .. }), "{err}");
    }

    #[test]
    fn test_corrupt_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("client.key.pem");
        fs::write(&key, "this is not a key\n").unwrap();

        let mut paths = CredentialPaths::in_dir(fixtures());
        paths.key_path = key;
        let err = TlsContext::build(&paths, 1).unwrap_err();
        assert!(matches!(err, ConfigError::CertificateLoad { .. }), "{err}");
    }

    #[test]
    fn test_missing_trust_anchor() {
        let mut paths = CredentialPaths::in_dir(fixtures());
        paths.ca_path = fixtures().join("no-such-ca.pem");
        let err = TlsContext::build(&paths, 1).unwrap_err();
        assert!(matches!(err, ConfigError::TrustAnchorLoad { .. }), "{err}");
    }

    #[test]
    fn test_corrupt_trust_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("root-ca.pem");
        fs::write(
            &ca,
            "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let mut paths = CredentialPaths::in_dir(fixtures());
        paths.ca_path = ca;
        let err = TlsContext::build(&paths, 1).unwrap_err();
        assert!(matches!(err, ConfigError::TrustAnchorLoad { .. }), "{err}");
    }

    #[test]
    fn test_depth_counts_only_non_anchor_issuers() {
        ensure_crypto_provider();
        let anchors = load_certificates(&fixtures().join("root-ca.pem")).unwrap();
        let intermediate = load_certificates(&fixtures().join("intermediate-ca.pem")).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(anchors.iter().cloned());
        let verifier = DepthLimitedVerifier {
            inner: WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap(),
            anchors: anchors.clone(),
            max_depth: 1,
        };

        assert_eq!(verifier.non_anchor_issuers(&anchors), 0);
        assert_eq!(verifier.non_anchor_issuers(&intermediate), 1);
    }
}
