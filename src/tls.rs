//! TLS termination for security profiles 2 (Basic Auth over TLS) and 3
//! (mTLS) (spec §6).
//!
//! No corpus file wires up a `rustls = "0.23"`-compatible acceptor (the one
//! TLS example in the retrieval pack targets a pre-0.21 API), so this module
//! follows `tokio-rustls`'s own accept-wrapped-listener idiom directly:
//! load a cert chain + key with `rustls_pemfile`, build a `ServerConfig`,
//! wrap it in a `TlsAcceptor` that `Server::run`'s accept loop calls
//! alongside the raw `TcpStream`.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::error::TlsError;
use crate::handshake::TlsInfo;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Build the server's `TlsAcceptor` for security profiles 2/3, or `None` for
/// profiles 0/1 (plain transport). Profile 3 additionally configures and
/// requires a client certificate — `handshake.tls.authorized` is derived
/// from the negotiated session in [`peer_tls_info`], and the upgrade
/// pipeline rejects the connection if it comes back `false` (spec §6: "3 =
/// mTLS … `handshake.tls.authorized` must be true").
pub fn build_acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>, TlsError> {
    if config.security_profile < 2 {
        return Ok(None);
    }
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Err(TlsError::MissingCertConfig(config.security_profile));
    };

    // rustls 0.23 requires a process-wide crypto provider before any
    // `ServerConfig` is built. Installing twice (e.g. two `Server`s in one
    // process, or repeated test construction) is expected, not an error.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let tls_config = if config.security_profile >= 3 {
        let ca_path = config.tls_client_ca_path.as_ref().ok_or(TlsError::MissingClientCa)?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::ClientVerifier(e.to_string()))?;
        rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    } else {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?
    };

    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

/// Derive `handshake.tls` from a completed server-side TLS session.
/// `authorized` is true iff the peer presented a certificate chain — only
/// possible when the acceptor required one, i.e. security profile 3.
pub fn peer_tls_info(tls: &tokio_rustls::server::TlsStream<TcpStream>) -> TlsInfo {
    let certs = tls.get_ref().1.peer_certificates();
    TlsInfo {
        authorized: certs.map(|c| !c.is_empty()).unwrap_or(false),
        cert: certs.and_then(|c| c.first()).map(|c| c.as_ref().to_vec()),
    }
}
