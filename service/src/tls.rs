//! TLS contexts and per-session TLS state, via rustls.

use crate::error::TlsError;
use bytes::BytesMut;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// PEM file paths identifying a TLS server.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// Certificate chain, leaf first.
    pub certificate: PathBuf,
    /// Private key (PKCS#8, PKCS#1, or SEC1).
    pub private_key: PathBuf,
}

/// Build a server-side rustls config from PEM cert/key files.
pub(crate) fn load_server_config(identity: &TlsIdentity) -> Result<Arc<ServerConfig>, TlsError> {
    let file = File::open(&identity.certificate)
        .map_err(|e| TlsError::Certificate(format!("{}: {e}", identity.certificate.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Certificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificates found in PEM".into()));
    }

    let file = File::open(&identity.private_key)
        .map_err(|e| TlsError::PrivateKey(format!("{}: {e}", identity.private_key.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::PrivateKey(e.to_string()))?
        .ok_or_else(|| TlsError::PrivateKey("no private key found in PEM".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Client-side config with the webpki root store, built once per process.
pub(crate) fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let roots =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// How a channel's TLS session is created.
pub(crate) enum TlsInit {
    /// Accept mode, using the listener's server config.
    Server(Arc<ServerConfig>),
    /// Connect mode, verifying against `server_name`.
    Client(Arc<ClientConfig>, ServerName<'static>),
}

/// Outcome of feeding socket bytes through the TLS session.
pub(crate) struct TlsRead {
    /// Decrypted bytes appended to the plaintext buffer.
    pub plaintext: usize,
    /// Peer sent close_notify or EOF.
    pub closed: bool,
}

/// Per-session TLS state machine.
///
/// The handshake is driven from the channel's readable/writable paths; no
/// application byte crosses in either direction until it completes.
pub(crate) struct TlsSession {
    conn: Connection,
}

impl TlsSession {
    pub fn new(init: &TlsInit) -> Result<Self, TlsError> {
        let conn = match init {
            TlsInit::Server(config) => Connection::from(
                ServerConnection::new(config.clone())
                    .map_err(|e| TlsError::Session(e.to_string()))?,
            ),
            TlsInit::Client(config, name) => Connection::from(
                ClientConnection::new(config.clone(), name.clone())
                    .map_err(|e| TlsError::Session(e.to_string()))?,
            ),
        };
        Ok(Self { conn })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Pull TLS records from the socket, decrypting into `plaintext`.
    ///
    /// Drains until the socket would block. A TLS protocol failure maps to
    /// an `InvalidData` error; the caller closes the channel.
    pub fn read_socket(
        &mut self,
        sock: &mut dyn Read,
        plaintext: &mut BytesMut,
    ) -> io::Result<TlsRead> {
        let mut out = TlsRead {
            plaintext: 0,
            closed: false,
        };

        loop {
            match self.conn.read_tls(sock) {
                Ok(0) => {
                    out.closed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }

            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = plaintext.len();
                plaintext.resize(start + pending, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
                out.plaintext += pending;
            }
            if state.peer_has_closed() {
                out.closed = true;
                break;
            }
        }

        Ok(out)
    }

    /// Queue plaintext for encryption. rustls buffers internally; the
    /// records reach the wire via [`TlsSession::flush`].
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    /// Push pending TLS records to the socket until empty or would-block.
    pub fn flush(&mut self, sock: &mut dyn Write) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
