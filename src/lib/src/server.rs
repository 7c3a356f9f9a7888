//! Mutual-TLS echo server
//!
//! One accept thread; every accepted connection gets its own worker thread,
//! which runs the handshake and then echoes bytes until the peer is done. The
//! accept loop never waits on a handshake.

use crate::error::TpmTlsError;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const ECHO_BUFFER_SIZE: usize = 4096;

/// Running echo server
pub struct EchoServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    accept_thread: Option<JoinHandle<()>>,
}

impl EchoServer {
    /// Bind `addr` and start accepting connections
    pub fn bind(addr: impl ToSocketAddrs, config: Arc<ServerConfig>) -> Result<Self, TpmTlsError> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));

        let accept_thread = {
            let stop = stop.clone();
            let accepted = accepted.clone();
            thread::Builder::new()
                .name("tpmtls-accept".to_string())
                .spawn(move || accept_loop(listener, config, stop, accepted))?
        };

        log::info!("Echo server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop,
            accepted,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections accepted so far
    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for the accept thread.
    ///
    /// Connections already handed to workers run to completion.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);

        // Unblock accept()
        if let Err(e) = TcpStream::connect(wake_addr(self.local_addr)) {
            log::warn!("Could not wake accept loop on {}: {}", self.local_addr, e);
        }
        if handle.join().is_err() {
            log::warn!("Accept thread panicked");
        }
        log::debug!("Echo server on {} stopped", self.local_addr);
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}

fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    stop: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let tcp = match stream {
            Ok(tcp) => tcp,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                continue;
            }
        };
        let id = accepted.fetch_add(1, Ordering::SeqCst) + 1;
        let config = config.clone();
        let spawned = thread::Builder::new()
            .name(format!("tpmtls-conn-{}", id))
            .spawn(move || {
                let peer = tcp.peer_addr().ok();
                match serve_connection(tcp, config) {
                    Ok(echoed) => {
                        log::debug!("Connection {} from {:?}: echoed {} bytes", id, peer, echoed)
                    }
                    Err(e) => log::warn!("Connection {} from {:?}: {}", id, peer, e),
                }
            });
        if let Err(e) = spawned {
            log::warn!("Could not spawn worker for connection {}: {}", id, e);
        }
    }
}

/// Handshake, then echo until EOF or close_notify. Returns the bytes echoed.
fn serve_connection(tcp: TcpStream, config: Arc<ServerConfig>) -> Result<u64, TpmTlsError> {
    let conn = ServerConnection::new(config)?;
    let mut tls = StreamOwned::new(conn, tcp);

    while tls.conn.is_handshaking() {
        tls.conn
            .complete_io(&mut tls.sock)
            .map_err(|e| TpmTlsError::HandshakeFailed(e.to_string()))?;
    }

    let mut buf = [0u8; ECHO_BUFFER_SIZE];
    let mut echoed = 0u64;
    loop {
        match tls.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                tls.write_all(&buf[..n])?;
                tls.flush()?;
                echoed += n as u64;
            }
            // Peer closed without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }

    tls.conn.send_close_notify();
    if let Err(e) = tls.conn.complete_io(&mut tls.sock) {
        log::debug!("close_notify not delivered: {}", e);
    }
    Ok(echoed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_addr() {
        let any: SocketAddr = "0.0.0.0:4433".parse().unwrap();
        assert_eq!(wake_addr(any), "127.0.0.1:4433".parse::<SocketAddr>().unwrap());

        let any6: SocketAddr = "[::]:4433".parse().unwrap();
        assert_eq!(wake_addr(any6), "[::1]:4433".parse::<SocketAddr>().unwrap());

        let fixed: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }
}
