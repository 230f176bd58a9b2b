//! Transports carrying encoded envelopes to the server.
//!
//! A transport only moves bytes: one request frame out, one response frame
//! back. Pairing and sequence checks happen in the proxy façade above it.

use crate::config::ClientConfig;
use parking_lot::Mutex;
use remoting_protocol::{read_frame, write_frame, FacadeError, FacadeResult, FrameHandler};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Carries one encoded request and returns the encoded response.
///
/// Implementations never retry; a failed round trip is reported as
/// [`FacadeError::Transport`].
pub trait Transport: Send + Sync {
    /// Sends `request` and blocks until the response arrives.
    fn round_trip(&self, request: Vec<u8>) -> FacadeResult<Vec<u8>>;
}

/// In-process transport handing frames straight to a [`FrameHandler`].
pub struct LoopbackTransport<H: FrameHandler> {
    handler: H,
    round_trips: AtomicU64,
}

impl<H: FrameHandler> LoopbackTransport<H> {
    /// Creates a transport in front of `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            round_trips: AtomicU64::new(0),
        }
    }

    /// Returns the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the number of round trips made.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }
}

impl<H: FrameHandler> Transport for LoopbackTransport<H> {
    fn round_trip(&self, request: Vec<u8>) -> FacadeResult<Vec<u8>> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        Ok(self.handler.handle_frame(&request))
    }
}

/// Transport over a TCP connection using length-prefixed frames.
///
/// Any failure during a round trip (timeout, I/O error, malformed or
/// oversized frame) leaves the stream at an unknown position, so the
/// connection is dropped and every later round trip fails.
pub struct StreamTransport {
    stream: Mutex<Option<TcpStream>>,
    max_frame_len: usize,
}

impl StreamTransport {
    /// Connects to a listener at `addr`.
    pub fn connect(addr: impl ToSocketAddrs, config: &ClientConfig) -> FacadeResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(config.timeout)?;
        stream.set_write_timeout(config.timeout)?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected");
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            max_frame_len: config.max_frame_len,
        })
    }

    /// Returns true until a round trip has failed.
    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn exchange(&self, stream: &mut TcpStream, request: &[u8]) -> FacadeResult<Vec<u8>> {
        write_frame(stream, request)?;
        read_frame(stream, self.max_frame_len)?
            .ok_or_else(|| FacadeError::transport("connection closed before the response"))
    }
}

impl Transport for StreamTransport {
    fn round_trip(&self, request: Vec<u8>) -> FacadeResult<Vec<u8>> {
        let mut slot = self.stream.lock();
        let stream = slot
            .as_mut()
            .ok_or_else(|| FacadeError::transport("connection dropped after an earlier failure"))?;
        let result = self.exchange(stream, &request);
        if let Err(err) = &result {
            warn!(error = %err, "round trip failed, dropping the connection");
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Echo;

    impl FrameHandler for Echo {
        fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
            frame.iter().rev().copied().collect()
        }
    }

    #[test]
    fn loopback_counts_round_trips() {
        let transport = LoopbackTransport::new(Echo);
        assert_eq!(transport.round_trip(vec![1, 2, 3]).unwrap(), vec![3, 2, 1]);
        assert_eq!(transport.round_trip(Vec::new()).unwrap(), Vec::<u8>::new());
        assert_eq!(transport.round_trips(), 2);
    }

    #[test]
    fn stream_reports_closed_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            read_frame(&mut socket, 1024).unwrap();
        });

        let transport = StreamTransport::connect(addr, &ClientConfig::default()).unwrap();
        let err = transport.round_trip(vec![7; 8]).unwrap_err();
        peer.join().unwrap();
        assert!(matches!(err, FacadeError::Transport(_)));
        assert!(!transport.is_connected());
    }

    #[test]
    fn late_reply_is_never_read_as_the_next_answer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let first = read_frame(&mut socket, 1024).unwrap().unwrap();
            std::thread::sleep(Duration::from_millis(300));
            let _ = write_frame(&mut socket, &first);
            // Anything still arriving is answered at once.
            while let Ok(Some(frame)) = read_frame(&mut socket, 1024) {
                let _ = write_frame(&mut socket, &frame);
            }
        });

        let config = ClientConfig::default().with_timeout(Duration::from_millis(100));
        let transport = StreamTransport::connect(addr, &config).unwrap();
        assert!(matches!(
            transport.round_trip(vec![1]).unwrap_err(),
            FacadeError::Transport(_)
        ));

        std::thread::sleep(Duration::from_millis(400));
        for _ in 0..3 {
            assert!(matches!(
                transport.round_trip(vec![2]).unwrap_err(),
                FacadeError::Transport(_)
            ));
        }
        assert!(!transport.is_connected());
        peer.join().unwrap();
    }

    #[test]
    fn oversized_reply_drops_the_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            read_frame(&mut socket, 1024).unwrap();
            let _ = write_frame(&mut socket, &[0u8; 64]);
        });

        let config = ClientConfig::default().with_max_frame_len(16);
        let transport = StreamTransport::connect(addr, &config).unwrap();
        assert!(matches!(
            transport.round_trip(vec![1]).unwrap_err(),
            FacadeError::Codec(_)
        ));
        assert!(!transport.is_connected());
        peer.join().unwrap();
    }
}
