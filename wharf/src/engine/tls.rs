//! TLS provider built on rustls.
//!
//! Client configurations carry the trusted store (webpki roots plus an
//! optional CA file/directory) and honor the verify mode; server
//! configurations load a PEM chain and key and may request client
//! certificates. Hostname matching is SAN-first with a single-label
//! leftmost wildcard, falling back to the subject CN only when the
//! certificate carries no SAN at all. The same policy applies on every
//! transport: the rustls client verifier layers the CN fallback on top of
//! the stock chain/SAN validation, and the DTLS path applies
//! [`verify_cert_host`] after its handshake.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::errors::{Error, Result};

/// Peer verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Verify {
    /// No validation at all (testing only).
    None,
    /// Valid chain and matching hostname are mandatory.
    #[default]
    Peer,
    /// Request a certificate; validate it only when presented.
    Optional,
}

/// PEM material and trust anchors for both roles.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain (leaf first).
    pub cert_chain: Option<PathBuf>,
    /// PEM private key.
    pub private_key: Option<PathBuf>,
    /// Additional trusted CA bundle file.
    pub ca_file: Option<PathBuf>,
    /// Directory scanned for `.pem`/`.crt` trust anchors.
    pub ca_dir: Option<PathBuf>,
    pub verify: Verify,
    /// ALPN protocols offered/accepted, in preference order.
    pub alpn: Vec<String>,
}

/// Immutable, shareable TLS contexts.
pub struct TlsProvider {
    config: TlsConfig,
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .map_err(|e| Error::tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(format!("bad certificate pem in {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .map_err(|e| Error::tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::tls(format!("bad key pem in {}: {e}", path.display())))?
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

fn trust_store(config: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(file) = &config.ca_file {
        for cert in load_certs(file)? {
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("rejected trust anchor: {e}")))?;
        }
    }
    if let Some(dir) = &config.ca_dir {
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::tls(format!("cannot scan {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_pem = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "pem" | "crt"))
                .unwrap_or(false);
            if !is_pem {
                continue;
            }
            for cert in load_certs(&path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::tls(format!("rejected trust anchor: {e}")))?;
            }
        }
    }
    Ok(roots)
}

mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::client::WebPkiServerVerifier;
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
    use std::sync::Arc;

    use super::match_hostname;

    /// Accept-anything verifier used by `Verify::None`.
    #[derive(Debug)]
    pub(super) struct NoVerify(pub(super) std::sync::Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// SAN-first verifier with a CN fallback for certificates that carry no
    /// SAN at all. Chain validation and SAN matching come from the stock
    /// webpki verifier; only its name rejection is revisited, and only when
    /// the end-entity certificate has no SAN extension.
    #[derive(Debug)]
    pub(super) struct SanThenCommonName {
        inner: Arc<WebPkiServerVerifier>,
    }

    impl SanThenCommonName {
        pub(super) fn new(roots: Arc<RootCertStore>) -> Result<Self, rustls::Error> {
            let inner = WebPkiServerVerifier::builder(roots)
                .build()
                .map_err(|e| rustls::Error::General(format!("verifier build: {e}")))?;
            Ok(Self { inner })
        }
    }

    fn is_name_mismatch(err: &CertificateError) -> bool {
        matches!(
            err,
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    }

    impl ServerCertVerifier for SanThenCommonName {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            let refused = match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(verified) => return Ok(verified),
                // Only a name mismatch is revisited; the chain was already
                // validated before webpki checks the name.
                Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => err,
                Err(err) => return Err(err),
            };
            let name_error = rustls::Error::InvalidCertificate(refused);

            let ServerName::DnsName(dns) = server_name else {
                return Err(name_error);
            };
            let cert = openssl::x509::X509::from_der(end_entity.as_ref())
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
            // The CN fallback applies only without SAN entries.
            let has_san = cert
                .subject_alt_names()
                .map(|sans| !sans.is_empty())
                .unwrap_or(false);
            if has_san {
                return Err(name_error);
            }
            let cn_matches = cert
                .subject_name()
                .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                .any(|entry| {
                    entry
                        .data()
                        .as_utf8()
                        .map(|cn| match_hostname(&cn, dns.as_ref()))
                        .unwrap_or(false)
                });
            if cn_matches {
                Ok(ServerCertVerified::assertion())
            } else {
                Err(name_error)
            }
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
}

impl TlsProvider {
    pub fn new(config: TlsConfig) -> Result<Self> {
        let provider = rustls::crypto::ring::default_provider();
        // Feature unification can pull in both the `ring` and `aws-lc-rs`
        // crypto backends transitively, which makes rustls's automatic
        // process-default detection ambiguous. Install the `ring` provider
        // explicitly; ignore the error if it's already installed.
        let _ = provider.clone().install_default();
        let provider = Arc::new(provider);

        let client = match config.verify {
            Verify::None => {
                let mut client = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(danger::NoVerify(Arc::clone(
                        &provider,
                    ))))
                    .with_no_client_auth();
                client.alpn_protocols = alpn_bytes(&config.alpn);
                client
            }
            Verify::Peer | Verify::Optional => {
                let roots = Arc::new(trust_store(&config)?);
                // Stock chain/SAN validation plus the no-SAN CN fallback,
                // so both TLS and DTLS apply the same hostname policy.
                let verifier = danger::SanThenCommonName::new(roots)
                    .map_err(|e| Error::tls(format!("server verifier: {e}")))?;
                let builder = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier));
                let mut client = match (&config.cert_chain, &config.private_key) {
                    (Some(chain), Some(key)) => builder
                        .with_client_auth_cert(load_certs(chain)?, load_key(key)?)
                        .map_err(|e| Error::tls(format!("client identity rejected: {e}")))?,
                    _ => builder.with_no_client_auth(),
                };
                client.alpn_protocols = alpn_bytes(&config.alpn);
                client
            }
        };

        let server = match (&config.cert_chain, &config.private_key) {
            (Some(chain), Some(key)) => {
                let certs = load_certs(chain)?;
                let key = load_key(key)?;
                // Client certificates are requested only when a trust store
                // for them exists; mutual TLS needs somewhere to chain to.
                let wants_client_certs = matches!(config.verify, Verify::Peer | Verify::Optional)
                    && (config.ca_file.is_some() || config.ca_dir.is_some());
                let builder = if wants_client_certs {
                    let roots = trust_store(&config)?;
                    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
                    let verifier = if config.verify == Verify::Optional {
                        verifier.allow_unauthenticated()
                    } else {
                        verifier
                    };
                    let verifier = verifier
                        .build()
                        .map_err(|e| Error::tls(format!("client verifier: {e}")))?;
                    ServerConfig::builder().with_client_cert_verifier(verifier)
                } else {
                    ServerConfig::builder().with_no_client_auth()
                };
                let mut server = builder
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::tls(format!("server identity rejected: {e}")))?;
                server.alpn_protocols = alpn_bytes(&config.alpn);
                Some(Arc::new(server))
            }
            _ => None,
        };

        debug!(verify = ?config.verify, has_server = server.is_some(), "tls provider ready");
        Ok(Self {
            config,
            client: Arc::new(client),
            server,
        })
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client)
    }

    /// Server context; absent until a chain and key are configured.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server
            .clone()
            .ok_or_else(|| Error::tls("server role needs a certificate chain and key"))
    }

    /// Parses the SNI host into the rustls server-name type.
    pub fn server_name(host: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(host.to_string())
            .map_err(|_| Error::tls(format!("invalid SNI host {host}")))
    }
}

fn alpn_bytes(alpn: &[String]) -> Vec<Vec<u8>> {
    alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Case-insensitive hostname match with a single-label leftmost wildcard.
///
/// `*.example.com` matches `a.example.com` but neither `example.com` nor
/// `a.b.example.com`; a wildcard never spans a dot and is only honored in
/// the leftmost label. Inputs are expected post-punycode (URL hosts already
/// are).
pub fn match_hostname(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }
    if !pattern.contains('*') {
        return pattern == host;
    }
    let Some(rest) = pattern.strip_prefix("*.") else {
        // A wildcard anywhere but a lone leftmost label is refused.
        return false;
    };
    if rest.contains('*') {
        return false;
    }
    let Some(prefix) = host.strip_suffix(rest) else {
        return false;
    };
    let Some(label) = prefix.strip_suffix('.') else {
        return false;
    };
    // Exactly one label may stand in for the wildcard.
    !label.is_empty() && !label.contains('.')
}

/// SAN-first certificate identity check used by the DTLS path.
///
/// DNS and IP SAN entries are consulted; the subject CN is a fallback only
/// when the certificate carries no SAN at all.
pub fn verify_cert_host(cert: &openssl::x509::X509Ref, host: &str) -> Result<()> {
    let ip_host = host.parse::<std::net::IpAddr>().ok();
    if let Some(sans) = cert.subject_alt_names() {
        let mut seen_any = false;
        for san in sans.iter() {
            seen_any = true;
            if let Some(dns) = san.dnsname() {
                if match_hostname(dns, host) {
                    return Ok(());
                }
            }
            if let (Some(ip_bytes), Some(expected)) = (san.ipaddress(), ip_host) {
                let matches = match (ip_bytes.len(), expected) {
                    (4, std::net::IpAddr::V4(v4)) => ip_bytes == v4.octets(),
                    (16, std::net::IpAddr::V6(v6)) => ip_bytes == v6.octets(),
                    _ => false,
                };
                if matches {
                    return Ok(());
                }
            }
        }
        if seen_any {
            return Err(Error::tls(format!(
                "certificate SAN entries do not cover {host}"
            )));
        }
    }
    // CN fallback applies only without SAN.
    let subject = cert.subject_name();
    for entry in subject.entries_by_nid(openssl::nid::Nid::COMMONNAME) {
        if let Ok(cn) = entry.data().as_utf8() {
            if match_hostname(&cn, host) {
                return Ok(());
            }
        }
    }
    Err(Error::tls(format!("certificate does not cover {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(match_hostname("API.Example.COM", "api.example.com"));
        assert!(!match_hostname("api.example.com", "www.example.com"));
    }

    #[test]
    fn wildcard_matches_exactly_one_label() {
        assert!(match_hostname("*.example.com", "api.example.com"));
        assert!(!match_hostname("*.example.com", "example.com"));
        assert!(!match_hostname("*.example.com", "a.b.example.com"));
    }

    #[test]
    fn wildcard_must_be_the_whole_leftmost_label() {
        assert!(!match_hostname("a*.example.com", "ab.example.com"));
        assert!(!match_hostname("api.*.com", "api.example.com"));
        assert!(!match_hostname("*", "example"));
    }

    #[test]
    fn idn_hosts_compare_post_punycode() {
        // `bücher.example` encodes to xn--bcher-kva.example before matching.
        let url = url::Url::parse("https://bücher.example/").unwrap();
        let host = url.host_str().unwrap();
        assert!(match_hostname("xn--bcher-kva.example", host));
    }

    #[test]
    fn trailing_dots_are_ignored() {
        assert!(match_hostname("example.com.", "example.com"));
    }

    #[test]
    fn provider_without_identity_has_no_server_role() {
        let provider = TlsProvider::new(TlsConfig::default()).unwrap();
        assert!(provider.server_config().is_err());
    }

    #[test]
    fn invalid_sni_is_rejected() {
        assert!(TlsProvider::server_name("bad host!").is_err());
        assert!(TlsProvider::server_name("api.example.com").is_ok());
    }
}
