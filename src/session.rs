//! Per-tick IMAP session
//!
//! A [`MailSession`] is opened at the start of a poll tick and closed
//! at its end. It speaks just the commands the fetcher needs: LOGIN,
//! SELECT INBOX, SEARCH UNSEEN, FETCH (RFC822) and LOGOUT.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::policy::TlsMode;
use async_imap::Session;
use async_imap::error::Error as ImapError;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session.
type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const INBOX: &str = "INBOX";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One message exactly as the server transferred it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Server-assigned sequence number.
    pub id: u32,
    bytes: Vec<u8>,
}

impl RawMessage {
    #[must_use]
    pub const fn new(id: u32, bytes: Vec<u8>) -> Self {
        Self { id, bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// An authenticated connection to the mail server.
///
/// Not reused across ticks: every tick opens its own session and
/// must hand it back through [`MailSession::close`].
pub struct MailSession {
    inner: ImapSession,
}

impl MailSession {
    /// Connect, secure the transport and log in.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the TCP connection cannot be made in
    ///   time or drops during login.
    /// - [`Error::Tls`] if STARTTLS or the handshake fails.
    /// - [`Error::Authentication`] if the server rejects the
    ///   credentials.
    pub async fn open(config: &Config) -> Result<Self> {
        let addr = config.address();
        debug!(%addr, tls = %config.tls, "Connecting to IMAP server");

        let tcp_stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Connection(format!("Timed out connecting to {addr}")))?
            .map_err(|e| Error::Connection(format!("Failed to connect to {addr}: {e}")))?;

        let tcp_stream = match config.tls {
            TlsMode::Implicit => tcp_stream,
            TlsMode::StartTls => starttls(tcp_stream).await?,
        };

        let connector = tls_connector(config.accept_invalid_certs)?;
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

        let tls_stream = timeout(
            config.connect_timeout,
            connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| Error::Tls("TLS handshake timed out".into()))?
        .map_err(|e| Error::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let inner = client
            .login(&config.username, &config.password)
            .await
            .map_err(|(e, _)| login_error(e))?;

        info!(host = %config.host, user = %config.username, "Logged in to IMAP server");
        Ok(Self { inner })
    }

    /// SELECT the inbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the server rejects the selection.
    pub async fn select_inbox(&mut self) -> Result<()> {
        let mailbox = self
            .inner
            .select(INBOX)
            .await
            .map_err(|e| command_error("SELECT INBOX", e))?;
        debug!(exists = mailbox.exists, "Selected INBOX");
        Ok(())
    }

    /// Sequence numbers of unseen messages, ascending by arrival.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the search is rejected.
    pub async fn search_unseen(&mut self) -> Result<Vec<u32>> {
        let ids = self
            .inner
            .search("UNSEEN")
            .await
            .map_err(|e| command_error("SEARCH UNSEEN", e))?;

        let mut ids: Vec<u32> = ids.into_iter().collect();
        ids.sort_unstable();
        debug!(count = ids.len(), "Searched unseen messages");
        Ok(ids)
    }

    /// FETCH one full message.
    ///
    /// Uses `RFC822` rather than `BODY.PEEK[]`, so the server marks
    /// the message `\Seen` and later ticks do not pick it up again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the fetch is rejected or the
    /// response carries no body (e.g. the message was expunged after
    /// the search).
    pub async fn fetch_raw(&mut self, id: u32) -> Result<RawMessage> {
        let mut messages = self
            .inner
            .fetch(id.to_string(), "RFC822")
            .await
            .map_err(|e| command_error("FETCH", e))?;

        // Drain the whole response so the connection stays in sync
        // even if the server interleaves unsolicited FETCH updates.
        let mut body = None;
        while let Some(item) = messages.next().await {
            let fetch = item.map_err(|e| command_error("FETCH", e))?;
            if body.is_none() && fetch.message == id {
                body = fetch.body().map(<[u8]>::to_vec);
            }
        }
        drop(messages);

        let bytes = body.ok_or_else(|| Error::Protocol(format!("No body found for message {id}")))?;
        debug!(id, size = bytes.len(), "Fetched message");
        Ok(RawMessage::new(id, bytes))
    }

    /// LOGOUT, best effort.
    ///
    /// Failures and timeouts are logged and otherwise ignored.
    pub async fn close(self) {
        self.close_within(CLOSE_TIMEOUT).await;
    }

    /// LOGOUT, giving up after `limit`.
    pub async fn close_within(mut self, limit: Duration) {
        match timeout(limit, self.inner.logout()).await {
            Ok(Ok(())) => debug!("Logged out"),
            Ok(Err(e)) => warn!(error = %e, "Logout failed"),
            Err(_) => warn!("Logout timed out"),
        }
    }
}

/// Issue STARTTLS on a plain connection and return the raw stream,
/// ready for the TLS handshake.
async fn starttls(tcp_stream: TcpStream) -> Result<TcpStream> {
    let mut client = async_imap::Client::new(tcp_stream.compat());

    client
        .run_command_and_check_ok("STARTTLS", None)
        .await
        .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;

    Ok(client.into_inner().into_inner())
}

fn login_error(e: ImapError) -> Error {
    match e {
        ImapError::No(msg) | ImapError::Bad(msg) => Error::Authentication(msg),
        other => Error::Connection(format!("Login failed: {other}")),
    }
}

fn command_error(command: &str, e: ImapError) -> Error {
    match e {
        ImapError::Io(e) => Error::Connection(format!("{command}: {e}")),
        ImapError::ConnectionLost => Error::Connection(format!("{command}: connection lost")),
        other => Error::Protocol(format!("{command} failed: {other}")),
    }
}

/// Build the TLS connector.
///
/// Certificates are checked against the Mozilla root set unless
/// `accept_invalid_certs` is set.
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts all certificates
/// (self-signed bridges and test servers).
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
