//! TLS with Encrypted Client Hello, on rustls.
//!
//! ## ECH
//!
//! With ECH on, the ClientHello visible on the wire carries the public name
//! from the ECHConfigList (the configured outer name); the real server name
//! only appears inside the encrypted inner hello. ECH is strict: if the
//! server does not accept it the handshake fails, there is no fallback to a
//! plain ClientHello that would leak the inner name.
//!
//! ## Limitations
//!
//! rustls does not expose extension ordering, so client-hello profiles only
//! reorder cipher suites.

use async_trait::async_trait;
use bytes::Buf;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{EchConfig, EchMode, EchStatus};
use rustls::crypto::{aws_lc_rs, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, EchConfigListBytes, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedCipherSuite,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{BoxedIo, TlsHandshaker, TlsParams};
use crate::config::{CertVerification, ClientFingerprint, EchPolicy};
use crate::error::{Result, TunnelError};

/// Cipher-suite ordering presented in the ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHelloProfile {
    Rustls,
    Chrome,
    Firefox,
    Safari,
}

impl ClientHelloProfile {
    pub fn resolve(fingerprint: ClientFingerprint) -> Self {
        match fingerprint {
            ClientFingerprint::None => Self::Rustls,
            ClientFingerprint::Chrome => Self::Chrome,
            ClientFingerprint::Firefox => Self::Firefox,
            ClientFingerprint::Safari => Self::Safari,
            ClientFingerprint::Random => Self::random(),
        }
    }

    fn random() -> Self {
        let mut buf = [0u8; 1];
        if aws_lc_rs::default_provider()
            .secure_random
            .fill(&mut buf)
            .is_err()
        {
            return Self::Chrome;
        }
        match buf[0] % 3 {
            0 => Self::Chrome,
            1 => Self::Firefox,
            _ => Self::Safari,
        }
    }

    pub fn cipher_suites(&self) -> Vec<SupportedCipherSuite> {
        use rustls::crypto::aws_lc_rs::cipher_suite::*;

        match self {
            Self::Rustls => aws_lc_rs::default_provider().cipher_suites,
            Self::Chrome => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            Self::Firefox => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            Self::Safari => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
        }
    }

    fn provider(&self) -> CryptoProvider {
        CryptoProvider {
            cipher_suites: self.cipher_suites(),
            ..aws_lc_rs::default_provider()
        }
    }
}

/// ECHConfig version from the ECH draft rustls implements.
const ECH_VERSION: u16 = 0xfe0d;

/// Check that an ECHConfigList advertises `outer_name` as its public name.
///
/// rustls takes the outer SNI from the list itself, so a list published for
/// a different front would silently put that name on the wire.
pub(crate) fn check_ech_public_name(
    list: &[u8],
    outer_name: &str,
) -> std::result::Result<(), String> {
    let names = ech_public_names(list)?;
    if names.is_empty() {
        return Err("ECH config list has no supported config".to_string());
    }
    if names.iter().any(|name| name.eq_ignore_ascii_case(outer_name)) {
        Ok(())
    } else {
        Err(format!(
            "ECH config public name {} does not match {}",
            names.join(", "),
            outer_name
        ))
    }
}

fn ech_public_names(mut list: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut configs = take_vec16(&mut list)?;
    if !list.is_empty() {
        return Err("trailing bytes after ECH config list".to_string());
    }

    let mut names = Vec::new();
    while !configs.is_empty() {
        let version = read_u16(&mut configs)?;
        let mut contents = take_vec16(&mut configs)?;
        if version != ECH_VERSION {
            continue;
        }
        // config_id, kem_id
        take(&mut contents, 3)?;
        // public_key, cipher_suites
        take_vec16(&mut contents)?;
        take_vec16(&mut contents)?;
        // maximum_name_length
        take(&mut contents, 1)?;
        let len = take(&mut contents, 1)?[0] as usize;
        let name = take(&mut contents, len)?;
        let name = std::str::from_utf8(name)
            .map_err(|_| "ECH public name is not UTF-8".to_string())?;
        names.push(name.to_string());
    }
    Ok(names)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> std::result::Result<&'a [u8], String> {
    if buf.len() < len {
        return Err("truncated ECH config list".to_string());
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_u16(buf: &mut &[u8]) -> std::result::Result<u16, String> {
    let mut bytes = take(buf, 2)?;
    Ok(bytes.get_u16())
}

fn take_vec16<'a>(buf: &mut &'a [u8]) -> std::result::Result<&'a [u8], String> {
    let len = read_u16(buf)? as usize;
    take(buf, len)
}

/// Minimal single-config ECHConfigList (X25519, HKDF-SHA256, AES-128-GCM).
#[cfg(test)]
pub(crate) fn sample_ech_config_list(public_name: &str) -> Vec<u8> {
    let mut contents = vec![7u8, 0x00, 0x20];
    contents.extend_from_slice(&32u16.to_be_bytes());
    contents.extend_from_slice(&[0x11; 32]);
    contents.extend_from_slice(&4u16.to_be_bytes());
    contents.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    contents.push(0);
    contents.push(public_name.len() as u8);
    contents.extend_from_slice(public_name.as_bytes());
    contents.extend_from_slice(&0u16.to_be_bytes());

    let mut config = ECH_VERSION.to_be_bytes().to_vec();
    config.extend_from_slice(&(contents.len() as u16).to_be_bytes());
    config.extend_from_slice(&contents);

    let mut list = (config.len() as u16).to_be_bytes().to_vec();
    list.extend_from_slice(&config);
    list
}

/// Default [`TlsHandshaker`]: rustls over tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsHandshaker;

impl RustlsHandshaker {
    pub fn client_config(&self, params: &TlsParams) -> Result<ClientConfig> {
        let provider = Arc::new(ClientHelloProfile::resolve(params.client_fingerprint).provider());
        let algorithms = provider.signature_verification_algorithms;
        let builder = ClientConfig::builder_with_provider(provider);

        let builder = match &params.ech {
            EchPolicy::Off => builder
                .with_safe_default_protocol_versions()
                .map_err(|e| TunnelError::Handshake(format!("TLS configuration: {}", e)))?,
            EchPolicy::Enabled {
                outer_name,
                config_list,
            } => {
                let list = config_list.as_ref().ok_or_else(|| {
                    TunnelError::Handshake(format!(
                        "no ECH config list available for {}",
                        outer_name
                    ))
                })?;
                check_ech_public_name(list, outer_name).map_err(TunnelError::Handshake)?;
                let ech = EchConfig::new(
                    EchConfigListBytes::from(list.clone()),
                    aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
                )
                .map_err(|e| TunnelError::Handshake(format!("ECH config for {}: {}", outer_name, e)))?;
                builder
                    .with_ech(EchMode::from(ech))
                    .map_err(|e| TunnelError::Handshake(format!("TLS configuration: {}", e)))?
            }
        };

        let mut config = match &params.verification {
            CertVerification::WebPki => {
                let root_store = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            CertVerification::SkipVerify => {
                warn!(server = %params.server_name, "TLS certificate verification disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
                        pin: None,
                        algorithms,
                    }))
                    .with_no_client_auth()
            }
            CertVerification::Fingerprint(pin) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
                    pin: Some(*pin),
                    algorithms,
                }))
                .with_no_client_auth(),
        };

        // The WebSocket upgrade is HTTP/1.1 only.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

#[async_trait]
impl TlsHandshaker for RustlsHandshaker {
    async fn handshake(&self, tcp: TcpStream, params: &TlsParams) -> Result<BoxedIo> {
        let config = self.client_config(params)?;
        let server_name = ServerName::try_from(params.server_name.clone()).map_err(|e| {
            TunnelError::Handshake(format!("invalid server name {}: {}", params.server_name, e))
        })?;

        let connector = TlsConnector::from(Arc::new(config));
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::Handshake(e.to_string()))?;

        let (_, conn) = stream.get_ref();
        if let Some(outer_name) = params.ech.outer_name() {
            match conn.ech_status() {
                EchStatus::Accepted => debug!(outer = %outer_name, "ECH accepted"),
                status => {
                    return Err(TunnelError::Handshake(format!(
                        "ECH not accepted by server ({:?})",
                        status
                    )))
                }
            }
        }

        debug!(
            server = %params.server_name,
            version = ?conn.protocol_version(),
            alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
            "TLS established"
        );
        Ok(Box::new(stream))
    }
}

/// Verifier for the two caller-selected trust modes: skip chain validation
/// entirely, or accept exactly one leaf certificate by SHA-256. Handshake
/// signatures are still checked against the presented certificate.
#[derive(Debug)]
struct RelaxedVerifier {
    pin: Option<[u8; 32]>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for RelaxedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pin {
            None => Ok(ServerCertVerified::assertion()),
            Some(pin) => {
                let digest: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
                if &digest == pin {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(rustls::Error::InvalidCertificate(
                        CertificateError::ApplicationVerificationFailure,
                    ))
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
