// transport.rs

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;

/// At most one peer waits in the accept queue per line
const LISTEN_BACKLOG: u32 = 1;

/// Error types for the transport layer
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind line {name} on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection lifecycle notice published by a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { line: String },
    Disconnected { line: String },
}

impl LinkEvent {
    pub fn line(&self) -> &str {
        match self {
            LinkEvent::Connected { line } | LinkEvent::Disconnected { line } => line,
        }
    }
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Channel carrying [`LinkEvent`]s from the lines to whoever resets state on disconnect.
pub fn link_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Trait defining the serial line interface
///
/// None of the operations block. Transient conditions are reported through
/// the returned byte counts rather than errors: a line without a peer sends
/// and receives nothing, and a short count is the only backpressure signal.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write as much of `data` as the line takes right now.
    ///
    /// # Returns
    ///
    /// * `usize` - Bytes written, 0 when no peer is connected
    async fn send(&self, data: &[u8]) -> usize;

    /// Read whatever is buffered, up to `buffer.len()` bytes.
    ///
    /// When the peer has closed its side the line drops to disconnected and
    /// the call reports `buffer.len()` so that read loops terminate.
    ///
    /// # Returns
    ///
    /// * `usize` - Bytes read, 0 when nothing is buffered or no peer is connected
    async fn receive(&self, buffer: &mut [u8]) -> usize;

    /// Like [`receive`](Self::receive) but leaves the bytes in place.
    ///
    /// Reports `buffer.len()` when no peer is connected, so it is only good
    /// for spotting a closed peer, not for deciding whether data is waiting.
    async fn peek(&self, buffer: &mut [u8]) -> usize;

    /// Whether a peer is currently attached
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum ReadMode {
    Consume,
    Peek,
}

struct Connection {
    stream: TcpStream,
    // distinguishes this peer from earlier ones on the same line
    generation: u64,
}

struct Endpoint {
    name: String,
    listener: TcpListener,
    // `Some` exactly while a peer is connected
    connection: RwLock<Option<Connection>>,
    accepted: AtomicU64,
    events: Option<LinkEventSender>,
}

/// A UART-like line emulated over a TCP listener.
///
/// Cloning is cheap and every clone refers to the same line, so the task that
/// reads or writes the line and the poller that accepts peers can each hold one.
#[derive(Clone)]
pub struct VirtualSerialTransport {
    inner: Arc<Endpoint>,
}

impl VirtualSerialTransport {
    /// Bind and listen for a peer on `addr`.
    ///
    /// The listener accepts without blocking and each accepted connection has
    /// Nagle's algorithm turned off, since lines mostly carry tiny writes.
    ///
    /// # Arguments
    ///
    /// * `name` - Line name used in logs and link events (e.g. "U2")
    /// * `addr` - Address to listen on; port 0 picks a free port
    /// * `events` - Where to publish connect/disconnect notices
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        name: &str,
        addr: SocketAddr,
        events: Option<LinkEventSender>,
    ) -> Result<Self, Error> {
        let listener = bind_listener(addr).map_err(|source| Error::Bind {
            name: name.to_string(),
            addr,
            source,
        })?;

        match listener.local_addr() {
            Ok(local) => info!("{}: listening on {}", name, local),
            Err(_) => info!("{}: listening on {}", name, addr),
        }

        Ok(Self {
            inner: Arc::new(Endpoint {
                name: name.to_string(),
                listener,
                connection: RwLock::new(None),
                accepted: AtomicU64::new(0),
                events,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.listener.local_addr()?)
    }

    /// Install a pending peer, if there is one.
    ///
    /// Does nothing while a peer is already connected, so it is safe to call
    /// on every poll.
    ///
    /// # Returns
    ///
    /// * `bool` - true if a new peer was installed
    pub fn try_accept(&self) -> bool {
        if self.is_connected() {
            return false;
        }

        let (stream, peer) = match self.inner.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                debug!("{}: accept failed: {}", self.inner.name, e);
                return false;
            }
        };

        if let Err(e) = configure_stream(&stream) {
            warn!("{}: dropping peer {}: {}", self.inner.name, peer, e);
            return false;
        }

        {
            let mut connection = self.inner.connection.write();
            if connection.is_some() {
                return false;
            }
            let generation = self.inner.accepted.fetch_add(1, Ordering::Relaxed) + 1;
            *connection = Some(Connection { stream, generation });
        }

        info!("{}: accepted connection from {}", self.inner.name, peer);
        self.publish(LinkEvent::Connected {
            line: self.inner.name.clone(),
        });
        true
    }

    /// Drop the current peer, if any.
    pub fn close(&self) {
        self.disconnect(None);
    }

    /// Drop the peer, but only if it is still the one from `generation` when
    /// one is given.
    fn disconnect(&self, generation: Option<u64>) {
        let previous = {
            let mut connection = self.inner.connection.write();
            match (connection.as_ref(), generation) {
                (Some(current), Some(expected)) if current.generation != expected => None,
                _ => connection.take(),
            }
        };
        if let Some(Connection { stream, .. }) = previous {
            let _ = stream.shutdown(Shutdown::Both);
            info!("{}: connection closed", self.inner.name);
            self.publish(LinkEvent::Disconnected {
                line: self.inner.name.clone(),
            });
        }
    }

    fn publish(&self, event: LinkEvent) {
        if let Some(events) = &self.inner.events {
            if events.send(event).is_err() {
                debug!("{}: no one is listening for link events", self.inner.name);
            }
        }
    }

    fn write_now(&self, data: &[u8]) -> usize {
        let connection = self.inner.connection.read();
        let Some(current) = connection.as_ref() else {
            return 0;
        };

        let mut stream: &TcpStream = &current.stream;
        match stream.write(data) {
            Ok(written) => written,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                debug!("{}: send failed: {}", self.inner.name, e);
                0
            }
        }
    }

    fn read_now(&self, buffer: &mut [u8], mode: ReadMode) -> usize {
        let (result, generation) = {
            let connection = self.inner.connection.read();
            let Some(current) = connection.as_ref() else {
                return match mode {
                    ReadMode::Consume => 0,
                    ReadMode::Peek => buffer.len(),
                };
            };

            let result = match mode {
                ReadMode::Consume => {
                    let mut stream: &TcpStream = &current.stream;
                    stream.read(buffer)
                }
                ReadMode::Peek => current.stream.peek(buffer),
            };
            (result, current.generation)
        };

        match result {
            Ok(0) if !buffer.is_empty() => {
                debug!("{}: peer closed its side ({:?})", self.inner.name, mode);
                self.disconnect(Some(generation));
                buffer.len()
            }
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                debug!("{}: {:?} failed: {}", self.inner.name, mode, e);
                0
            }
        }
    }
}

#[async_trait]
impl Transport for VirtualSerialTransport {
    async fn send(&self, data: &[u8]) -> usize {
        self.write_now(data)
    }

    async fn receive(&self, buffer: &mut [u8]) -> usize {
        self.read_now(buffer, ReadMode::Consume)
    }

    async fn peek(&self, buffer: &mut [u8]) -> usize {
        self.read_now(buffer, ReadMode::Peek)
    }

    fn is_connected(&self) -> bool {
        self.inner.connection.read().is_some()
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(LISTEN_BACKLOG)?.into_std()?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(())
}
