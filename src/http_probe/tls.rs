use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ProtocolVersion, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_parser::parse_x509_certificate;

use super::transport::TlsInfo;
use crate::config::{TlsConfig, TlsVersion};
use crate::error::ProbeError;

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Builds the rustls client configuration of a probe.
///
/// A configured `ca_file` replaces the bundled web PKI roots. With
/// `enable_http2` the handshake offers h2 ahead of http/1.1.
pub fn client_config(tls: &TlsConfig, enable_http2: bool) -> Result<Arc<ClientConfig>, ProbeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = match tls.min_version {
        Some(TlsVersion::Tls13) => TLS13_ONLY,
        Some(TlsVersion::Tls12) | None => rustls::ALL_VERSIONS,
    };

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| construction("unsupported TLS versions", &e))?;

    let roots = match &tls.ca_file {
        Some(path) => load_roots(path)?,
        None => RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
    };
    let builder = builder.with_root_certificates(roots);

    let mut config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = PrivateKeyDer::from_pem_file(key_file)
                .map_err(|e| construction(&format!("reading {}", key_file.display()), &e))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| construction("invalid client certificate", &e))?
        }
        _ => builder.with_no_client_auth(),
    };

    if tls.insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipVerification { provider }));
    }

    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(Arc::new(config))
}

fn construction(context: &str, err: &dyn std::fmt::Display) -> ProbeError {
    ProbeError::TransportConstruction(format!("{context}: {err}"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProbeError> {
    let context = format!("reading {}", path.display());
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| construction(&context, &e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| construction(&context, &e))?;
    if certs.is_empty() {
        return Err(construction(&context, &"no certificates found"));
    }
    Ok(certs)
}

fn load_roots(path: &Path) -> Result<RootCertStore, ProbeError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| construction(&format!("invalid CA in {}", path.display()), &e))?;
    }
    Ok(roots)
}

/// Accepts any server certificate. Used for `insecure_skip_verify`.
#[derive(Debug)]
struct SkipVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_0 => "TLS 1.0".to_string(),
        ProtocolVersion::TLSv1_1 => "TLS 1.1".to_string(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// What a probe reports about the TLS connection of its final response.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSummary {
    pub version: String,
    /// Unix seconds of the soonest `notAfter` in the presented chain.
    pub earliest_cert_expiry: Option<f64>,
    /// Unix seconds at which the presented chain stops being valid as a whole.
    pub last_chain_expiry: Option<f64>,
    /// Hex SHA-256 of the leaf certificate.
    pub fingerprint_sha256: String,
}

impl TlsSummary {
    pub fn from_info(info: &TlsInfo) -> Self {
        let expiries: Vec<i64> = info
            .peer_certificates
            .iter()
            .filter_map(|der| parse_x509_certificate(der.as_ref()).ok())
            .map(|(_, cert)| cert.validity().not_after.timestamp())
            .collect();
        let earliest = expiries.iter().min().map(|ts| *ts as f64);

        let fingerprint_sha256 = info
            .peer_certificates
            .first()
            .map(|leaf| hex(&Sha256::digest(leaf.as_ref())))
            .unwrap_or_default();

        Self {
            version: info.version.clone(),
            earliest_cert_expiry: earliest,
            // earliest notAfter of the presented chain
            last_chain_expiry: earliest,
            fingerprint_sha256,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
