//! Server certificate policy used when peer verification is disabled.
//!
//! Disabling verification does not accept everything: expired, not yet
//! valid, revoked and badly signed certificates are still rejected, and a
//! chain that does verify must also match the expected host name. Every
//! other problem (typically an unknown issuer) is logged and tolerated.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
pub(crate) struct LenientServerVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl LenientServerVerifier {
    pub(crate) fn new(inner: Option<Arc<WebPkiServerVerifier>>, provider: Arc<CryptoProvider>) -> Self {
        Self { inner, provider }
    }
}

// Problems that stay fatal even with verification turned off.
fn is_fatal(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::Expired
                | CertificateError::ExpiredContext { .. }
                | CertificateError::NotValidYet
                | CertificateError::NotValidYetContext { .. }
                | CertificateError::Revoked
                | CertificateError::BadSignature
                | CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. }
        )
    )
}

fn check_validity_period(end_entity: &CertificateDer<'_>, now: UnixTime) -> Result<(), TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
        .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
    let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);
    let validity = cert.validity();

    if now < validity.not_before.timestamp() {
        return Err(TlsError::InvalidCertificate(CertificateError::NotValidYet));
    }
    if now > validity.not_after.timestamp() {
        return Err(TlsError::InvalidCertificate(CertificateError::Expired));
    }
    Ok(())
}

impl ServerCertVerifier for LenientServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        check_validity_period(end_entity, now)?;

        let Some(inner) = &self.inner else {
            warn!(server_name = ?server_name, "Certificate verification is disabled, accepting unverified certificate");
            return Ok(ServerCertVerified::assertion());
        };

        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Ok(verified) => Ok(verified),
            Err(err) if is_fatal(&err) => Err(err),
            Err(err) => {
                warn!(server_name = ?server_name, %err, "Certificate verification failed, accepting because verification is disabled");
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_conditions() {
        assert!(is_fatal(&TlsError::InvalidCertificate(CertificateError::Expired)));
        assert!(is_fatal(&TlsError::InvalidCertificate(CertificateError::Revoked)));
        assert!(is_fatal(&TlsError::InvalidCertificate(CertificateError::NotValidForName)));
        assert!(!is_fatal(&TlsError::InvalidCertificate(CertificateError::UnknownIssuer)));
        assert!(!is_fatal(&TlsError::General("other".into())));
    }
}
