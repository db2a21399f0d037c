//! TLS client configuration for the parent dialer.
//!
//! The parent presents whatever certificate it likes — deployments pin trust
//! in the shared key handshake, not the TLS chain — so server certificates
//! are accepted without verification. An optional client certificate can be
//! presented from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, ServerName};

use crate::config::TlsClientFiles;
use crate::error::RelayError;

/// Build the rustls client config, with an optional client certificate.
pub fn client_config(files: Option<&TlsClientFiles>) -> Result<ClientConfig, RelayError> {
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert));

    let config = match files {
        Some(files) => {
            let certs = load_certs(&files.cert)?;
            let key = load_key(&files.key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(RelayError::Tls)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, RelayError> {
    let file = File::open(path)
        .map_err(|e| RelayError::Config(format!("failed to open cert file {path:?}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| RelayError::Config(format!("failed to parse cert file {path:?}: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::Config(format!(
            "no certificates found in {path:?}"
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey, RelayError> {
    let file = File::open(path)
        .map_err(|e| RelayError::Config(format!("failed to open key file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    for item in rustls_pemfile::read_all(&mut reader)
        .map_err(|e| RelayError::Config(format!("failed to parse key file {path:?}: {e}")))?
    {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(RelayError::Config(format!(
        "no private key found in {path:?}"
    )))
}

/// Accepts any server certificate.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
