//! Serving the façade over TCP.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use remoting_protocol::{handle_encoded, read_frame, write_frame, FrameHandler, ServerFacade};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Adapts a [`ServerFacade`] to encoded frames.
pub struct ServerEndpoint {
    facade: Arc<dyn ServerFacade>,
    frames: AtomicU64,
}

impl ServerEndpoint {
    /// Wraps `facade`.
    pub fn new(facade: Arc<dyn ServerFacade>) -> Self {
        Self {
            facade,
            frames: AtomicU64::new(0),
        }
    }

    /// Returns the number of frames handled.
    pub fn frames_handled(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl FrameHandler for ServerEndpoint {
    fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        handle_encoded(self.facade.as_ref(), frame)
    }
}

/// Accepts connections and answers request frames.
///
/// Each connection is served on its own thread; frames on one connection
/// are answered strictly in order.
pub struct Listener {
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    max_frame_len: usize,
}

impl Listener {
    /// Binds to `config.bind_addr`.
    pub fn bind(config: &ServerConfig, handler: Arc<dyn FrameHandler>) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            handler,
            max_frame_len: config.max_frame_len,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the process ends.
    pub fn run(self) -> ServerResult<()> {
        self.accept_until(&AtomicBool::new(false), launch_connection);
        Ok(())
    }

    /// Runs the listener on a background thread.
    pub fn spawn(self) -> ServerResult<ListenerHandle> {
        let addr = self.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("remoting-listener".into())
            .spawn(move || self.accept_until(&flag, launch_connection))?;
        Ok(ListenerHandle {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Hands every accepted connection to `launch` until `shutdown` is set.
    ///
    /// A connection that cannot be launched is dropped; the listener keeps
    /// accepting.
    fn accept_until<F>(&self, shutdown: &AtomicBool, launch: F)
    where
        F: Fn(TcpStream, Arc<dyn FrameHandler>, usize) -> io::Result<()>,
    {
        for stream in self.listener.incoming() {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            if let Err(err) = launch(stream, Arc::clone(&self.handler), self.max_frame_len) {
                warn!(error = %err, "connection dropped, could not start its thread");
            }
        }
    }
}

fn launch_connection(
    stream: TcpStream,
    handler: Arc<dyn FrameHandler>,
    max_frame_len: usize,
) -> io::Result<()> {
    thread::Builder::new()
        .name("remoting-connection".into())
        .spawn(move || serve_connection(stream, handler.as_ref(), max_frame_len))
        .map(drop)
}

fn serve_connection(mut stream: TcpStream, handler: &dyn FrameHandler, max_frame_len: usize) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".into());
    debug!(%peer, "connection opened");

    loop {
        let frame = match read_frame(&mut stream, max_frame_len) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(%peer, error = %err, "dropping connection");
                break;
            }
        };
        let reply = handler.handle_frame(&frame);
        if let Err(err) = write_frame(&mut stream, &reply) {
            warn!(%peer, error = %err, "reply not delivered");
            break;
        }
    }

    debug!(%peer, "connection closed");
}

/// A listener running on a background thread.
pub struct ListenerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the listener thread.
    ///
    /// Connections already open are served until their peers disconnect.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.addr);
        if thread.join().is_err() {
            warn!("listener thread panicked");
        }
        info!(addr = %self.addr, "listener shut down");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
