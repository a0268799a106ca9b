//! In-process fake IMAP server for integration testing
//!
//! # Connection lifecycle
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   implicit TLS:  TLS handshake, then greeting "* OK ..."
//!   STARTTLS:      greeting, "STARTTLS", then TLS handshake
//!       |
//!   LOGIN user pass
//!       |
//!   SELECT INBOX
//!       |
//!   SEARCH UNSEEN          -> "* SEARCH 1 3"
//!       |
//!   FETCH 3 RFC822         -> counted literal, message becomes \Seen
//!       |
//!   LOGOUT
//! ```
//!
//! Every client command starts with a **tag** (async-imap uses
//! `A0001`, `A0002`, ...). The server echoes the tag in its completion
//! response; lines prefixed with `*` are untagged data sent before it.
//!
//! The mailbox is shared across connections, so state changes made
//! by one poll (messages becoming seen) are visible to the next.

use super::handlers::{handle_fetch, handle_login, handle_logout, handle_search, handle_select};
use super::io::write_line;
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

#[derive(Debug, Clone, Copy)]
enum Transport {
    Implicit,
    StartTls,
}

/// State shared between the test and every connection task.
#[derive(Default)]
struct Shared {
    mailbox: Mutex<Mailbox>,
    /// Command names in the order the server received them.
    commands: Mutex<Vec<String>>,
}

/// A fake IMAP server that runs on localhost with an OS-assigned port.
///
/// The server generates a self-signed TLS certificate at startup using
/// `rcgen`, so clients must be configured to accept invalid
/// certificates.
pub struct FakeImapServer {
    port: u16,
    shared: Arc<Shared>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server that expects TLS from the first byte (IMAPS).
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Transport::Implicit).await
    }

    /// Start a server that greets in plaintext and requires STARTTLS.
    pub async fn start_starttls(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Transport::StartTls).await
    }

    async fn spawn(mailbox: Mailbox, transport: Transport) -> Self {
        // Multiple tests may race to install the provider; losing the
        // race is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(mailbox),
            commands: Mutex::default(),
        });

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let shared = Arc::clone(&task_shared);
                tokio::spawn(async move {
                    handle_connection(stream, acceptor, transport, &shared).await;
                });
            }
        });

        Self {
            port,
            shared,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of the current mailbox state.
    pub fn mailbox(&self) -> Mailbox {
        self.shared.mailbox.lock().unwrap().clone()
    }

    /// Upper-cased command names received so far, across connections.
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }
}

/// Secure the connection according to `transport`, then run the
/// command loop.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    transport: Transport,
    shared: &Shared,
) {
    let tcp = match transport {
        Transport::Implicit => stream,
        Transport::StartTls => match negotiate_starttls(stream).await {
            Some(tcp) => tcp,
            None => return,
        },
    };

    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };
    let mut reader = BufReader::new(tls_stream);

    if matches!(transport, Transport::Implicit)
        && write_line(&mut reader, GREETING).await.is_err()
    {
        return;
    }

    handle_imap_session(reader, shared).await;
}

/// Greet in plaintext and wait for STARTTLS. Returns the raw stream
/// ready for the TLS handshake.
async fn negotiate_starttls(stream: tokio::net::TcpStream) -> Option<tokio::net::TcpStream> {
    let mut reader = BufReader::new(stream);
    write_line(&mut reader, GREETING).await.ok()?;

    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;

    let (tag, command) = line.trim().split_once(' ')?;
    if !command.eq_ignore_ascii_case("STARTTLS") {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return None;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    write_line(&mut reader, &resp).await.ok()?;
    Some(reader.into_inner())
}

fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the IMAP command loop over an established TLS stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each client command
/// into a strongly-typed `Command`, then dispatches on the
/// `CommandBody` variant. Commands other than LOGIN and LOGOUT are
/// refused until the client has authenticated.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    shared: &Shared,
) {
    let codec = CommandCodec::default();
    let mut authenticated = false;
    let mut selected = false;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(name) = trimmed.split_whitespace().nth(1) {
            shared.commands.lock().unwrap().push(name.to_uppercase());
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = shared.mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            CommandBody::Login { .. } => {
                authenticated = handle_login(tag, trimmed, &snap, &mut reader).await;
            }
            _ if !authenticated => {
                let resp = format!("{tag} BAD Not authenticated\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
            CommandBody::Select { mailbox: mb, .. } => {
                selected = handle_select(tag, &mailbox_name(&mb), &snap, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: false,
                ..
            } => {
                handle_search(tag, criteria.as_ref(), &snap, selected, &mut reader).await;
            }
            CommandBody::Fetch {
                sequence_set,
                uid: false,
                ..
            } => {
                handle_fetch(tag, &sequence_set, &shared.mailbox, selected, &mut reader).await;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
