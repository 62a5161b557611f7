//! Mutual TLS configuration built from mesh credentials.
//!
//! Servers require a client certificate chained to the mesh root; clients
//! present their own certificate and verify the server against the same
//! root, using the target service id as the expected name.

use crate::error::SecurityError;
use crate::security::Credentials;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn tls_error(message: impl Into<String>) -> SecurityError {
    SecurityError::TlsConfig(message.into())
}

/// Parses every certificate of a PEM bundle.
fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(tls_error("no certificates found"));
    }
    Ok(certs)
}

/// Parses the first private key of a PEM bundle.
fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, SecurityError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| tls_error(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| tls_error("no private key found"))
}

fn root_store(ca_pem: &str) -> Result<RootCertStore, SecurityError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("invalid mesh root: {}", e)))?;
    }
    Ok(roots)
}

/// Server configuration that requires client certificates.
pub fn server_config(credentials: &Credentials) -> Result<Arc<ServerConfig>, SecurityError> {
    let roots = root_store(&credentials.ca_pem)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| tls_error(format!("failed to build client verifier: {}", e)))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&credentials.cert_pem)?,
            load_private_key(&credentials.key_pem)?,
        )
        .map_err(|e| tls_error(format!("failed to configure TLS: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client configuration presenting the caller's certificate.
pub fn client_config(credentials: &Credentials) -> Result<Arc<ClientConfig>, SecurityError> {
    let roots = root_store(&credentials.ca_pem)?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            load_certs(&credentials.cert_pem)?,
            load_private_key(&credentials.key_pem)?,
        )
        .map_err(|e| tls_error(format!("failed to configure client auth: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub fn acceptor(credentials: &Credentials) -> Result<TlsAcceptor, SecurityError> {
    Ok(TlsAcceptor::from(server_config(credentials)?))
}

pub fn connector(credentials: &Credentials) -> Result<TlsConnector, SecurityError> {
    Ok(TlsConnector::from(client_config(credentials)?))
}

/// Name a client expects in the certificate of `service_id`.
pub fn server_name(service_id: &str) -> Result<ServerName<'static>, SecurityError> {
    ServerName::try_from(service_id.to_string())
        .map_err(|e| tls_error(format!("invalid server name '{}': {}", service_id, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::security::{CertificateAuthority, LocalCertificateAuthority, SecurityLayer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn layer(root: &str) -> SecurityLayer {
        SecurityLayer::new(
            SecurityConfig::default(),
            Arc::new(LocalCertificateAuthority::generate(root).unwrap()),
            None,
        )
    }

    #[test]
    fn test_load_errors() {
        assert!(load_certs("not pem").is_err());
        assert!(load_private_key("").is_err());
        assert!(server_name("lake").is_ok());
    }

    #[tokio::test]
    async fn test_mutual_handshake() {
        let layer = layer("tls-test-root");
        let server_creds = layer.establish_mtls("lake").await.unwrap();
        let client_creds = layer.establish_mtls("gateway").await.unwrap();

        let acceptor = acceptor(&server_creds).unwrap();
        let connector = connector(&client_creds).unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
            buf
        });

        let mut stream = connector
            .connect(server_name("lake").unwrap(), client_io)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();

        assert_eq!(&reply, b"pong");
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_foreign_client_rejected() {
        let mesh = layer("tls-mesh-root");
        let outsider = layer("tls-outsider-root");
        let server_creds = mesh.establish_mtls("lake").await.unwrap();
        let mut foreign = (*outsider.establish_mtls("gateway").await.unwrap()).clone();
        // Trust the mesh root so only the server side can refuse.
        foreign.ca_pem = server_creds.ca_pem.clone();

        let acceptor = acceptor(&server_creds).unwrap();
        let connector = connector(&foreign).unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move { acceptor.accept(server_io).await.is_ok() });
        let client = async {
            let mut stream = connector
                .connect(server_name("lake").unwrap(), client_io)
                .await?;
            stream.write_all(b"ping").await?;
            stream.flush().await?;
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(())
        };

        assert!(client.await.is_err());
        assert!(!server.await.unwrap());
    }

    #[tokio::test]
    async fn test_restored_root_trusts_original_peers() {
        let original = LocalCertificateAuthority::generate("tls-persisted-root").unwrap();
        let restored =
            LocalCertificateAuthority::from_pem(&original.root_pem(), &original.key_pem()).unwrap();
        let before = SecurityLayer::new(SecurityConfig::default(), Arc::new(original), None);
        let after = SecurityLayer::new(SecurityConfig::default(), Arc::new(restored), None);
        let server_creds = before.establish_mtls("lake").await.unwrap();
        let client_creds = after.establish_mtls("gateway").await.unwrap();

        let acceptor = acceptor(&server_creds).unwrap();
        let connector = connector(&client_creds).unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut stream = connector
            .connect(server_name("lake").unwrap(), client_io)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }
}
