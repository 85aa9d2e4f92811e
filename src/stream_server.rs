//! Best-effort TCP packet mirror.
//!
//! A separate consumer process can attach to port 53516 and receive every
//! encoded packet as a 4-byte big-endian length followed by the raw bytes.
//! The server binds lazily on the first `send_data`, accepts exactly one
//! client, and treats every failure as "tear the client down and wait for
//! the next one" - encoding never stalls on this channel.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Default side-channel port.
pub const STREAM_PORT: u16 = 53516;

/// Timeout applied to the accepted socket.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

struct Inner {
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    port: u16,
}

/// One-client length-prefixed packet mirror.
pub struct StreamServer {
    inner: Mutex<Inner>,
}

impl StreamServer {
    pub fn new() -> Self {
        Self::with_port(STREAM_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                listener: None,
                client: None,
                port,
            }),
        }
    }

    /// Mirror one packet payload. Never blocks the encoder: all failures
    /// are swallowed after tearing the client down.
    pub fn send_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock();

        if inner.listener.is_none() {
            match TcpListener::bind(("0.0.0.0", inner.port)) {
                Ok(listener) => {
                    if let Err(e) = listener.set_nonblocking(true) {
                        warn!("Stream server nonblocking setup failed: {}", e);
                        return;
                    }
                    info!("Stream side-channel listening on port {}", inner.port);
                    inner.listener = Some(listener);
                }
                Err(e) => {
                    debug!("Stream side-channel bind failed: {}", e);
                    return;
                }
            }
        }

        if inner.client.is_none() {
            let accepted = inner
                .listener
                .as_ref()
                .and_then(|listener| listener.accept().ok());
            if let Some((stream, peer)) = accepted {
                info!("Stream side-channel client connected from {}", peer);
                let _ = stream.set_read_timeout(Some(CLIENT_TIMEOUT));
                let _ = stream.set_write_timeout(Some(CLIENT_TIMEOUT));
                inner.client = Some(stream);
            }
        }

        let Some(client) = inner.client.as_mut() else {
            return;
        };

        let length = (data.len() as u32).to_be_bytes();
        let result = client
            .write_all(&length)
            .and_then(|()| client.write_all(data));
        if let Err(e) = result {
            warn!("Stream side-channel write failed ({}), dropping client", e);
            inner.client = None;
        }
    }

    /// Orderly-exit teardown: drop the client and the listening socket.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.client = None;
        inner.listener = None;
    }
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn free_port() -> u16 {
        // Bind to 0 and let the OS pick; racy but good enough for a test.
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    #[test]
    fn test_send_without_client_is_silent() {
        let server = StreamServer::with_port(free_port());
        // No client, nothing blows up, nothing blocks.
        server.send_data(&[1, 2, 3]);
        server.send_data(&[4, 5, 6]);
        server.shutdown();
    }

    #[test]
    fn test_length_prefixed_frames_reach_client() {
        let port = free_port();
        let server = StreamServer::with_port(port);

        // First send initializes the listener.
        server.send_data(&[0xAA]);

        let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        // The accept happens on the next send; that packet is the first
        // one the client observes.
        server.send_data(&[1, 2, 3, 4, 5]);

        let mut length = [0u8; 4];
        client.read_exact(&mut length).expect("length");
        assert_eq!(u32::from_be_bytes(length), 5);

        let mut payload = [0u8; 5];
        client.read_exact(&mut payload).expect("payload");
        assert_eq!(payload, [1, 2, 3, 4, 5]);

        server.shutdown();
    }

    #[test]
    fn test_client_loss_does_not_poison() {
        let port = free_port();
        let server = StreamServer::with_port(port);
        server.send_data(&[0]);

        {
            let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            server.send_data(&[1]);
            // Client drops here.
        }

        // Writes after the disconnect tear the client down and keep going.
        for _ in 0..4 {
            server.send_data(&[2, 3]);
        }
        server.shutdown();
    }
}
