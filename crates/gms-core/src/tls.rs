//! TLS material loading for both sides of the transport.

use crate::error::{GmsError, GmsResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn read_pem(path: &Path, what: &str) -> GmsResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| GmsError::Config(format!("cannot read {what} {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8], path: &Path) -> GmsResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GmsError::Config(format!("bad certificate PEM {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(GmsError::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn load_server_tls(cert_path: &Path, key_path: &Path) -> GmsResult<TlsAcceptor> {
    let cert_pem = read_pem(cert_path, "cert")?;
    let key_pem = read_pem(key_path, "key")?;

    let certs = parse_certs(&cert_pem, cert_path)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| GmsError::Config(format!("bad key PEM {}: {e}", key_path.display())))?
        .ok_or_else(|| {
            GmsError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GmsError::Config(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GmsError::Config(format!("TLS certificate rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector trusting the PEM root certificate(s) at `root_path`.
pub fn load_client_tls(root_path: &Path) -> GmsResult<TlsConnector> {
    let pem = read_pem(root_path, "root certificate")?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in parse_certs(&pem, root_path)? {
        roots
            .add(cert)
            .map_err(|e| GmsError::Config(format!("root certificate rejected: {e}")))?;
    }

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GmsError::Config(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_packet, write_packet};
    use crate::transport::{
        connect, ClientSocketConfig, HostPointer, ServerSocket, ServerSocketConfig,
    };
    use std::path::PathBuf;
    use std::time::Duration;

    struct Material {
        _dir: tempfile::TempDir,
        root: PathBuf,
        cert: PathBuf,
        key: PathBuf,
    }

    fn generate() -> Material {
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root.pem");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&root, ca.pem()).unwrap();
        std::fs::write(&cert, leaf.pem()).unwrap();
        std::fs::write(&key, leaf_key.serialize_pem()).unwrap();

        Material {
            _dir: dir,
            root,
            cert,
            key,
        }
    }

    #[tokio::test]
    async fn tls_round_trip_over_loopback() {
        let m = generate();
        let mut server_config = ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0));
        server_config.tls = Some(load_server_tls(&m.cert, &m.key).unwrap());
        let socket = ServerSocket::bind(&server_config).await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let client_config = ClientSocketConfig {
            tls: Some(load_client_tls(&m.root).unwrap()),
            ..Default::default()
        };
        let client = tokio::spawn(async move {
            let mut conn = connect(&HostPointer::new("127.0.0.1", port), &client_config)
                .await
                .unwrap();
            write_packet(&mut conn.writer, b"secret").await.unwrap();
            read_packet(&mut conn.reader, 64).await.unwrap().unwrap()
        });

        let mut conn = socket
            .accept(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("client should connect");
        let got = read_packet(&mut conn.reader, 64).await.unwrap().unwrap();
        assert_eq!(got, b"secret");
        write_packet(&mut conn.writer, b"ok").await.unwrap();

        assert_eq!(client.await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn silent_peer_handshake_runs_apart_from_accepting() {
        let m = generate();
        let mut server_config = ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0));
        server_config.tls = Some(load_server_tls(&m.cert, &m.key).unwrap());
        server_config.handshake_timeout = Duration::from_secs(2);
        let socket = ServerSocket::bind(&server_config).await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let _silent = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let silent = socket
            .accept_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("silent peer should connect");
        assert!(silent.needs_handshake());
        let silent = tokio::spawn(silent.establish());

        let client_config = ClientSocketConfig {
            tls: Some(load_client_tls(&m.root).unwrap()),
            ..Default::default()
        };
        let client = tokio::spawn(async move {
            connect(&HostPointer::new("127.0.0.1", port), &client_config).await
        });
        let pending = socket
            .accept_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("client should connect");
        pending.establish().await.unwrap();
        assert!(client.await.unwrap().is_ok());
        assert!(!silent.is_finished(), "silent handshake should still be waiting");

        assert!(matches!(silent.await.unwrap(), Err(GmsError::Timeout)));
    }

    #[test]
    fn missing_files_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let nowhere = dir.path().join("absent.pem");
        assert!(matches!(
            load_server_tls(&nowhere, &nowhere),
            Err(GmsError::Config(_))
        ));
        assert!(matches!(load_client_tls(&nowhere), Err(GmsError::Config(_))));
    }

    #[test]
    fn empty_pem_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(load_client_tls(&empty), Err(GmsError::Config(_))));
    }
}
