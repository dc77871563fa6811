use super::options::{CipherPolicy, PemSource, TlsOptions};
use super::verifier::LenientServerVerifier;
use crate::error::Error;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};
use std::sync::Arc;
use tracing::{debug, warn};

const DH_PEM_BEGIN: &str = "-----BEGIN DH PARAMETERS-----";
const DH_PEM_END: &str = "-----END DH PARAMETERS-----";
const DER_SEQUENCE: u8 = 0x30;
const DER_INTEGER: u8 = 0x02;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(policy: CipherPolicy) -> &'static [&'static SupportedProtocolVersion] {
    match policy {
        CipherPolicy::Normal => rustls::DEFAULT_VERSIONS,
        CipherPolicy::Tls13 => TLS13_ONLY,
    }
}

fn load_certs(source: &PemSource) -> Result<Vec<CertificateDer<'static>>, Error> {
    let pem = source.read().map_err(|e| Error::TlsCertificateLoad {
        path: source.describe(),
        source: e,
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {}",
            source.describe()
        )));
    }
    Ok(chain)
}

fn load_key(source: &PemSource) -> Result<PrivateKeyDer<'static>, Error> {
    let pem = source.read().map_err(|e| Error::TlsKeyLoad {
        path: source.describe(),
        source: e,
    })?;
    private_key(&mut &pem[..])
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {}", source.describe())))
}

fn load_roots(source: &PemSource) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(source)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }
    Ok(roots)
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_identity(options: &TlsOptions) -> Result<Option<Identity>, Error> {
    match (&options.cert, &options.key) {
        (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_key(key)?))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(Error::TlsInvalidKey(
            "A certificate was given without a private key".to_string(),
        )),
        (None, Some(_)) => Err(Error::TlsInvalidCertificate(
            "A private key was given without a certificate".to_string(),
        )),
    }
}

/// Builds the client-role TLS context.
///
/// Fails with [`Error::TlsMissingTrust`] if verification is enabled without
/// trusted authorities.
pub(crate) fn build_client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, Error> {
    let provider = provider();
    let roots = options.ca.as_ref().map(load_roots).transpose()?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(protocol_versions(options.cipher_policy))
        .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;

    let builder = if options.verify_certificate {
        let roots = roots.ok_or_else(|| {
            Error::TlsMissingTrust("certificate verification is enabled".to_string())
        })?;
        builder.with_root_certificates(roots)
    } else {
        let inner = match roots {
            Some(roots) => Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?,
            ),
            None => {
                warn!("Certificate verification is disabled and no CA is configured");
                None
            }
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(LenientServerVerifier::new(inner, provider)))
    };

    let config = match load_identity(options)? {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };

    debug!(policy = ?options.cipher_policy, verify = options.verify_certificate, "Built TLS client context");
    Ok(Arc::new(config))
}

/// Builds the server-role TLS context.
///
/// The server identity is mandatory. Requiring client certificates needs
/// trusted authorities. Diffie-Hellman parameters are validated here so a
/// malformed blob stops the server from starting.
pub(crate) fn build_server_config(options: &TlsOptions) -> Result<Arc<ServerConfig>, Error> {
    let provider = provider();

    let roots = if options.require_client_cert {
        let ca = options.ca.as_ref().ok_or_else(|| {
            Error::TlsMissingTrust("client certificates are required".to_string())
        })?;
        Some(load_roots(ca)?)
    } else {
        None
    };

    let (chain, key) = load_identity(options)?.ok_or(Error::TlsServerConfigMissing)?;

    if let Some(dh_params) = &options.dh_params {
        let bits = load_dh_params(dh_params)?;
        debug!(bits, "Loaded Diffie-Hellman parameters");
    }

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(protocol_versions(options.cipher_policy))
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

    let builder = match roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

    debug!(policy = ?options.cipher_policy, require_client_cert = options.require_client_cert, "Built TLS server context");
    Ok(Arc::new(config))
}

// ============================================================================
// Diffie-Hellman Parameters
// ============================================================================

/// Parses PKCS#3 `DH PARAMETERS` and returns the prime size in bits.
fn load_dh_params(source: &PemSource) -> Result<usize, Error> {
    let pem = source
        .read()
        .map_err(|e| Error::TlsInvalidDhParams(format!("{}: {e}", source.describe())))?;
    let pem = std::str::from_utf8(&pem)
        .map_err(|_| Error::TlsInvalidDhParams("PEM data is not valid UTF-8".to_string()))?;

    let body = pem
        .split_once(DH_PEM_BEGIN)
        .and_then(|(_, rest)| rest.split_once(DH_PEM_END))
        .map(|(body, _)| body)
        .ok_or_else(|| Error::TlsInvalidDhParams("No DH PARAMETERS block found".to_string()))?;
    let body: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der = STANDARD
        .decode(body)
        .map_err(|e| Error::TlsInvalidDhParams(format!("Invalid base64: {e}")))?;

    parse_dh_der(&der).ok_or_else(|| Error::TlsInvalidDhParams("Malformed DER structure".to_string()))
}

fn parse_dh_der(der: &[u8]) -> Option<usize> {
    let (params, rest) = der_element(der, DER_SEQUENCE)?;
    if !rest.is_empty() {
        return None;
    }
    let (prime, params) = der_element(params, DER_INTEGER)?;
    let (generator, _) = der_element(params, DER_INTEGER)?;

    let prime = strip_leading_zeros(prime);
    let generator = strip_leading_zeros(generator);
    let odd = prime.last().is_some_and(|byte| byte & 1 == 1);
    let generator_ok = match generator {
        [] => false,
        [g] => *g > 1,
        _ => true,
    };
    if !odd || !generator_ok {
        return None;
    }
    Some(prime.len() * 8 - prime[0].leading_zeros() as usize)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

// Returns (contents, remainder) of one definite-length DER element.
fn der_element(input: &[u8], tag: u8) -> Option<(&[u8], &[u8])> {
    let (&first, input) = input.split_first()?;
    if first != tag {
        return None;
    }
    let (&len, mut input) = input.split_first()?;
    let len = if len < 0x80 {
        usize::from(len)
    } else {
        let count = usize::from(len & 0x7f);
        if count == 0 || count > 4 || input.len() < count {
            return None;
        }
        let (bytes, rest) = input.split_at(count);
        input = rest;
        bytes.iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
    };
    if input.len() < len {
        return None;
    }
    Some(input.split_at(len))
}
