//! Platform pipe primitives.
//!
//! The bridge speaks over the platform's native local duplex transport:
//! named pipes on Windows, Unix domain sockets elsewhere. Only the
//! abstract operations the server needs are exposed; each logical message
//! is written in exactly one send and clients read one message at a time.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, PipeMode, ServerOptions,
};

/// Largest handshake request the server will read.
const READ_BUFFER_SIZE: usize = 1024;

/// Result of a liveness probe on an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The peer is still there.
    Alive,
    /// The peer closed its end.
    Disconnected,
}

/// Does this error mean the peer is gone (as opposed to a transient
/// failure worth tolerating)?
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Server endpoint accepting client connections one at a time.
#[cfg(unix)]
pub struct PipeListener {
    inner: UnixListener,
    path: String,
}

#[cfg(unix)]
impl PipeListener {
    /// Create the server endpoint at `addr`.
    pub fn bind(addr: &str) -> io::Result<PipeListener> {
        // A stale socket file from an unclean shutdown blocks the bind.
        let _ = std::fs::remove_file(addr);
        let inner = UnixListener::bind(addr)?;
        log::info!("Listening on \"{}\"", addr);
        Ok(PipeListener {
            inner,
            path: addr.to_owned(),
        })
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> io::Result<PipeStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(PipeStream { inner: stream })
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Server endpoint accepting client connections one at a time.
#[cfg(windows)]
pub struct PipeListener {
    addr: String,
    instance: NamedPipeServer,
}

#[cfg(windows)]
impl PipeListener {
    /// Create the server endpoint at `addr`.
    pub fn bind(addr: &str) -> io::Result<PipeListener> {
        let instance = ServerOptions::new()
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Message)
            .create(addr)?;
        log::info!("Listening on \"{}\"", addr);
        Ok(PipeListener {
            addr: addr.to_owned(),
            instance,
        })
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> io::Result<PipeStream> {
        self.instance.connect().await?;
        // Stand up the next instance before handing this one out so no
        // connection attempt finds the name missing.
        let next = ServerOptions::new()
            .pipe_mode(PipeMode::Message)
            .create(&self.addr)?;
        let connected = std::mem::replace(&mut self.instance, next);
        Ok(PipeStream {
            inner: WindowsStream::Server(connected),
        })
    }
}

/// One connected duplex pipe.
#[cfg(unix)]
pub struct PipeStream {
    inner: UnixStream,
}

#[cfg(unix)]
impl PipeStream {
    /// Connect to a server endpoint (client side; used by tests and to
    /// unblock a shutting-down acceptor).
    pub async fn connect(addr: &str) -> io::Result<PipeStream> {
        let inner = UnixStream::connect(addr).await?;
        Ok(PipeStream { inner })
    }

    async fn io_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await
    }

    async fn io_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    fn io_try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.try_read(buf)
    }
}

#[cfg(windows)]
enum WindowsStream {
    Server(NamedPipeServer),
    Client(NamedPipeClient),
}

/// One connected duplex pipe.
#[cfg(windows)]
pub struct PipeStream {
    inner: WindowsStream,
}

#[cfg(windows)]
impl PipeStream {
    /// Connect to a server endpoint (client side; used by tests and to
    /// unblock a shutting-down acceptor).
    pub async fn connect(addr: &str) -> io::Result<PipeStream> {
        const ERROR_PIPE_BUSY: i32 = 231;
        loop {
            match ClientOptions::new().pipe_mode(PipeMode::Message).open(addr) {
                Ok(client) => {
                    return Ok(PipeStream {
                        inner: WindowsStream::Client(client),
                    });
                }
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn io_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            WindowsStream::Server(s) => s.write_all(bytes).await,
            WindowsStream::Client(c) => c.write_all(bytes).await,
        }
    }

    async fn io_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            WindowsStream::Server(s) => s.read(buf).await,
            WindowsStream::Client(c) => c.read(buf).await,
        }
    }

    fn io_try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            WindowsStream::Server(s) => s.try_read(buf),
            WindowsStream::Client(c) => c.try_read(buf),
        }
    }
}

impl PipeStream {
    /// Write one logical message in a single send.
    pub async fn write_message(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io_write(bytes).await
    }

    /// Read one message from the peer. An empty read maps to
    /// `UnexpectedEof`.
    pub async fn read_message(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = self.io_read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the pipe",
            ));
        }
        buf.truncate(n);
        Ok(buf)
    }

    /// Non-blocking liveness check for idle connections.
    ///
    /// Pending data from the peer counts as alive; it stays buffered.
    pub fn probe(&self) -> Probe {
        let mut scratch = [0u8; 16];
        match self.io_try_read(&mut scratch) {
            Ok(0) => Probe::Disconnected,
            Ok(_) => Probe::Alive,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Probe::Alive,
            Err(ref e) if is_disconnect(e) => Probe::Disconnected,
            Err(e) => {
                log::debug!("Probe error treated as disconnect: {}", e);
                Probe::Disconnected
            }
        }
    }
}
