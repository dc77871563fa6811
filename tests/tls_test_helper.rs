#![allow(dead_code)]

use hubsock::{PemSource, TlsOptions};
use std::io::Write;
use tempfile::NamedTempFile;

/// PEM encoded certificate and private key
pub struct TestIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestIdentity {
    pub fn cert(&self) -> PemSource {
        PemSource::Data(self.cert_pem.clone().into_bytes())
    }

    pub fn key(&self) -> PemSource {
        PemSource::Data(self.key_pem.clone().into_bytes())
    }
}

/// Self-signed certificate valid for the given names
pub fn self_signed(names: &[&str]) -> TestIdentity {
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let certified_key = rcgen::generate_simple_self_signed(names).unwrap();
    TestIdentity {
        cert_pem: certified_key.cert.pem(),
        key_pem: certified_key.key_pair.serialize_pem(),
    }
}

/// Self-signed certificate for "localhost" that expired long ago
pub fn expired() -> TestIdentity {
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(2001, 1, 1);
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    TestIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

/// Server TLS options presenting `identity`
pub fn server_tls(identity: &TestIdentity) -> TlsOptions {
    TlsOptions {
        cert: Some(identity.cert()),
        key: Some(identity.key()),
        ..TlsOptions::default()
    }
}

/// Client TLS options trusting `ca` and verifying the peer
pub fn client_tls(ca: &TestIdentity) -> TlsOptions {
    TlsOptions {
        ca: Some(ca.cert()),
        ..TlsOptions::default()
    }
}

/// Client TLS options with verification disabled and no trusted CA
pub fn client_tls_unverified() -> TlsOptions {
    TlsOptions {
        verify_certificate: false,
        ..TlsOptions::default()
    }
}

/// Write PEM text to a temporary file that is deleted on drop
pub fn temp_pem(pem: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(pem.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
