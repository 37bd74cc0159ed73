//! TLS front end for the local web server.
//!
//! Peers that were offered a package with `peerHosted="true"` download it
//! over https. The proxy terminates TLS with the configured certificate and
//! relays each connection to the plain web server on `127.0.0.1`.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::{debug, info, warn};

use crate::core::constants::{
    DEFAULT_HTTPS_PROXY_CONN_TIMEOUT, HTTPS_PROXY_POLL_INTERVAL, HTTPS_PROXY_THREADS,
};
use crate::core::{CommoError, Result};
use crate::streaming::tls::parse_certs;
use crate::threading::{Signal, StopFlag, ThreadWorker, ThreadedHandler};

const READ_CHUNK: usize = 16 * 1024;
const BUFFER_LIMIT: usize = 256 * 1024;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct Listening {
    port: u16,
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

struct Inner {
    server: Mutex<Option<Listening>>,
    local_http_port: AtomicU16,
    conn_timeout: Mutex<Duration>,
    wake: Signal,
}

/// Accepts https connections and relays them to the local web server.
pub struct HttpsProxy {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl HttpsProxy {
    /// Create a proxy that is not listening yet.
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            server: Mutex::new(None),
            local_http_port: AtomicU16::new(0),
            conn_timeout: Mutex::new(DEFAULT_HTTPS_PROXY_CONN_TIMEOUT),
            wake: Signal::new(),
        });
        let handler = ThreadedHandler::new(HTTPS_PROXY_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Listen on `port` with the given certificate chain and key.
    ///
    /// Port 0 stops listening. Connections already relayed are unaffected.
    pub fn set_server_params(&self, port: u16, cert_pem: Option<&str>, key_pem: Option<&str>) -> Result<()> {
        info!(port, "https proxy port changing");
        *self.inner.server.lock() = None;
        if port == 0 {
            return Ok(());
        }
        let (Some(cert_pem), Some(key_pem)) = (cert_pem, key_pem) else {
            return Err(CommoError::invalid("https proxy needs a certificate and key"));
        };
        let config = server_config(cert_pem, key_pem)?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|e| {
            warn!(port, error = %e, "https proxy could not bind");
            CommoError::invalid(format!("cannot listen on port {port}"))
        })?;
        listener.set_nonblocking(true)?;
        *self.inner.server.lock() = Some(Listening {
            port,
            listener,
            config,
        });
        self.inner.wake.raise();
        Ok(())
    }

    /// Port of the local web server to relay to; 0 refuses new connections.
    pub fn set_local_http_port(&self, port: u16) {
        self.inner.local_http_port.store(port, Ordering::Release);
    }

    /// Idle limit for relayed connections.
    pub fn set_conn_timeout(&self, timeout: Duration) {
        *self.inner.conn_timeout.lock() = timeout;
    }

    /// Port currently listened on.
    pub fn port(&self) -> Option<u16> {
        self.inner.server.lock().as_ref().map(|s| s.port)
    }
}

impl Drop for HttpsProxy {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
    }
}

fn server_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    let chain = parse_certs(cert_pem).map_err(|_| CommoError::InvalidCert)?;
    if chain.is_empty() {
        return Err(CommoError::InvalidCert);
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem.as_bytes()))
        .map_err(|_| CommoError::InvalidCert)?
        .ok_or(CommoError::InvalidCert)?;
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| CommoError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| {
            debug!(error = %e, "https proxy certificate rejected");
            CommoError::InvalidCert
        })?;
    Ok(Arc::new(config))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Active,
    Idle,
    Done,
}

struct ProxyConn {
    peer: SocketAddr,
    tls: StreamOwned<ServerConnection, TcpStream>,
    upstream: TcpStream,
    to_upstream: Vec<u8>,
    to_client: Vec<u8>,
    client_eof: bool,
    upstream_eof: bool,
    upstream_shut: bool,
    close_sent: bool,
    last_activity: Instant,
}

impl ProxyConn {
    fn open(sock: TcpStream, peer: SocketAddr, config: Arc<ServerConfig>, http_port: u16) -> std::io::Result<Self> {
        let upstream = TcpStream::connect_timeout(
            &SocketAddr::from((Ipv4Addr::LOCALHOST, http_port)),
            UPSTREAM_CONNECT_TIMEOUT,
        )?;
        upstream.set_nonblocking(true)?;
        upstream.set_nodelay(true)?;
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;
        let conn = ServerConnection::new(config).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        Ok(Self {
            peer,
            tls: StreamOwned::new(conn, sock),
            upstream,
            to_upstream: Vec::new(),
            to_client: Vec::new(),
            client_eof: false,
            upstream_eof: false,
            upstream_shut: false,
            close_sent: false,
            last_activity: Instant::now(),
        })
    }

    fn service(&mut self, now: Instant, timeout: Duration) -> std::io::Result<Step> {
        let mut moved = false;
        let mut buf = [0u8; READ_CHUNK];

        if !self.client_eof && self.to_upstream.len() < BUFFER_LIMIT {
            match self.tls.read(&mut buf) {
                Ok(0) => self.client_eof = true,
                Ok(n) => {
                    self.to_upstream.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => self.client_eof = true,
                Err(e) => return Err(e),
            }
        }
        if !self.to_upstream.is_empty() {
            match self.upstream.write(&self.to_upstream) {
                Ok(n) => {
                    self.to_upstream.drain(..n);
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if self.client_eof && self.to_upstream.is_empty() && !self.upstream_shut {
            let _ = self.upstream.shutdown(Shutdown::Write);
            self.upstream_shut = true;
        }

        if !self.upstream_eof && self.to_client.len() < BUFFER_LIMIT {
            match self.upstream.read(&mut buf) {
                Ok(0) => self.upstream_eof = true,
                Ok(n) => {
                    self.to_client.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if !self.to_client.is_empty() && !self.tls.conn.is_handshaking() {
            let n = self.tls.conn.writer().write(&self.to_client)?;
            self.to_client.drain(..n);
        }
        if self.upstream_eof && self.to_client.is_empty() && !self.close_sent {
            self.tls.conn.send_close_notify();
            self.close_sent = true;
        }
        while self.tls.conn.wants_write() {
            match self.tls.conn.write_tls(&mut self.tls.sock) {
                Ok(_) => moved = true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if self.close_sent && !self.tls.conn.wants_write() {
            return Ok(Step::Done);
        }
        if self.client_eof && self.upstream_eof && self.to_client.is_empty() {
            return Ok(Step::Done);
        }
        if moved {
            self.last_activity = now;
            Ok(Step::Active)
        } else if now.duration_since(self.last_activity) > timeout {
            Err(std::io::Error::new(ErrorKind::TimedOut, "relay idle too long"))
        } else {
            Ok(Step::Idle)
        }
    }
}

impl Inner {
    fn accept(&self, conns: &mut Vec<ProxyConn>) -> bool {
        let guard = self.server.lock();
        let Some(server) = guard.as_ref() else {
            return false;
        };
        let mut accepted = false;
        loop {
            match server.listener.accept() {
                Ok((sock, peer)) => {
                    accepted = true;
                    let http_port = self.local_http_port.load(Ordering::Acquire);
                    if http_port == 0 {
                        debug!(%peer, "https connection refused; local web server disabled");
                        continue;
                    }
                    match ProxyConn::open(sock, peer, Arc::clone(&server.config), http_port) {
                        Ok(conn) => conns.push(conn),
                        Err(e) => debug!(%peer, error = %e, "could not relay https connection"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(port = server.port, error = %e, "https accept failed");
                    break;
                }
            }
        }
        accepted
    }

    fn io_loop(&self, stop: &StopFlag) {
        let mut conns: Vec<ProxyConn> = Vec::new();
        while !stop.should_stop() {
            let mut busy = self.accept(&mut conns);
            let timeout = *self.conn_timeout.lock();
            let now = Instant::now();
            conns.retain_mut(|conn| match conn.service(now, timeout) {
                Ok(Step::Active) => {
                    busy = true;
                    true
                }
                Ok(Step::Idle) => true,
                Ok(Step::Done) => false,
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "https relay closed");
                    false
                }
            });
            if !busy {
                self.wake.wait(stop, HTTPS_PROXY_POLL_INTERVAL);
            }
        }
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, _index: usize, stop: &StopFlag) {
        self.io_loop(stop);
    }

    fn thread_stop_signal(&self, _index: usize) {
        self.wake.wake();
    }
}

#[cfg(all(test, feature = "certgen"))]
mod tests {
    use super::*;
    use crate::core::constants::FILE_SERVER_INFO;
    use crate::crypto::certgen::generate_self_signed_cert;
    use crate::http::engine::{HttpEngine, HttpOptions, HttpTls, ReqwestEngine};
    use crate::http::server::{FileLookup, FileServer};
    use std::path::PathBuf;

    struct Nothing;

    impl FileLookup for Nothing {
        fn file_for_transfer(&self, _id: u32) -> Option<PathBuf> {
            None
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn test_missing_or_bad_certificate() {
        let proxy = HttpsProxy::new().unwrap();
        assert!(matches!(
            proxy.set_server_params(free_port(), None, None),
            Err(CommoError::InvalidArgument(_))
        ));
        assert!(matches!(
            proxy.set_server_params(free_port(), Some("junk"), Some("junk")),
            Err(CommoError::InvalidCert)
        ));
        assert!(proxy.set_server_params(0, None, None).is_ok());
        assert_eq!(proxy.port(), None);
    }

    #[test]
    fn test_relays_to_local_server() {
        let server = FileServer::start(0, Arc::new(Nothing)).unwrap();
        let (cert, key) = generate_self_signed_cert("commo-test").unwrap();
        let proxy = HttpsProxy::new().unwrap();
        proxy.set_local_http_port(server.port());
        let port = free_port();
        proxy.set_server_params(port, Some(&cert), Some(&key)).unwrap();
        assert_eq!(proxy.port(), Some(port));

        let engine = ReqwestEngine::new().unwrap();
        let opts = HttpOptions {
            tls: HttpTls::Insecure,
            ..HttpOptions::default()
        };
        let resp = engine.get(&format!("https://127.0.0.1:{port}/getinfo"), &opts).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, FILE_SERVER_INFO);
    }
}
