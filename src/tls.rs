//! STARTTLS upgrades, both as initiator and responder
//!
//! The upgrade runs on an already-connected transport. On success the
//! caller gets a new [`BoxConn`] plus a handshake record; on failure the
//! transport is consumed and closed, no partial upgrade is ever exposed.

use crate::codec::{framed, unframe, BoxConn};
use crate::error::{NntpError, Result};
use crate::response::{self, codes};
use std::sync::Arc;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{CipherSuite, ClientConfig, ProtocolVersion, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// What the TLS handshake negotiated
#[derive(Debug, Clone, Default)]
pub struct TlsHandshakeInfo {
    /// Handshake ran to completion
    pub handshake_complete: bool,
    /// Negotiated protocol version
    pub protocol: Option<ProtocolVersion>,
    /// Negotiated cipher suite
    pub cipher_suite: Option<CipherSuite>,
    /// Certificates presented by the peer
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// A client config validating against the Mozilla root store
///
/// Daemons that pin per-peer certificates supply their own config through
/// `Daemon::tls_config_for`; this is the sane default.
pub fn webpki_client_config() -> Arc<ClientConfig> {
    let _ = CryptoProvider::install_default(ring::default_provider());
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Upgrade an outbound connection: consume the plaintext banner, issue
/// STARTTLS, expect 382, then run the client handshake
pub async fn initiate_starttls(
    conn: BoxConn,
    config: Arc<ClientConfig>,
    host: &str,
) -> Result<(BoxConn, TlsHandshakeInfo)> {
    let (mut reader, mut writer) = framed(conn);

    let greeting = reader.read_line().await?;
    let (code, message) = response::parse_reply_line(&greeting)?;
    if !response::is_success(code) {
        return Err(NntpError::Protocol { code, message });
    }

    writer.send_line("STARTTLS").await?;
    let reply = reader.read_line().await?;
    let (code, message) = response::parse_reply_line(&reply)?;
    if code != codes::CONTINUE_TLS {
        return Err(NntpError::Protocol { code, message });
    }

    let conn = unframe(reader, writer);
    let server_name = ServerName::try_from(host)
        .map_err(|e| NntpError::Tls(format!("invalid TLS server name {host:?}: {e}")))?
        .to_owned();
    let stream = TlsConnector::from(config)
        .connect(server_name, conn)
        .await
        .map_err(|e| NntpError::Tls(format!("client handshake failed: {e}")))?;

    let info = {
        let (_, session) = stream.get_ref();
        TlsHandshakeInfo {
            handshake_complete: !session.is_handshaking(),
            protocol: session.protocol_version(),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite()),
            peer_certificates: cloned_certs(session.peer_certificates()),
        }
    };
    debug!(host, protocol = ?info.protocol, "STARTTLS established");
    Ok((Box::new(stream), info))
}

/// Upgrade an inbound connection: answer 382 and run the server handshake
pub async fn accept_starttls(
    conn: BoxConn,
    config: Arc<ServerConfig>,
) -> Result<(BoxConn, TlsHandshakeInfo)> {
    let (reader, mut writer) = framed(conn);
    writer.send_line("382 Continue with TLS negotiation").await?;
    let conn = unframe(reader, writer);

    let stream = TlsAcceptor::from(config)
        .accept(conn)
        .await
        .map_err(|e| NntpError::Tls(format!("server handshake failed: {e}")))?;

    let info = {
        let (_, session) = stream.get_ref();
        TlsHandshakeInfo {
            handshake_complete: !session.is_handshaking(),
            protocol: session.protocol_version(),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite()),
            peer_certificates: cloned_certs(session.peer_certificates()),
        }
    };
    debug!(protocol = ?info.protocol, "accepted STARTTLS upgrade");
    Ok((Box::new(stream), info))
}

fn cloned_certs(certs: Option<&[CertificateDer<'_>]>) -> Vec<CertificateDer<'static>> {
    certs
        .map(|cs| cs.iter().map(|c| c.clone().into_owned()).collect())
        .unwrap_or_default()
}
