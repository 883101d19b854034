use log::{debug, info};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timed out after {timeout:?} waiting for {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection closed by peer")]
    Broken,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Blocking byte channel to the model server
pub trait Transport {
    /// Wait up to `timeout` for the endpoint and open it. No-op when already connected.
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Fill `buf` completely or fail
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write all of `bytes` or fail
    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Release the handle. Safe to call repeatedly.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Read until `buf` is full, looping over short reads
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::Broken),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_broken(&e) => return Err(TransportError::Broken),
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(())
}

/// Write all of `bytes`, looping over short writes
pub fn write_full<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => {
                return Err(TransportError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "channel accepted zero bytes",
                )))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    writer.flush()?;
    Ok(())
}

fn is_broken(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Where the model server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
    #[cfg(windows)]
    NamedPipe(PathBuf),
}

impl Endpoint {
    /// The well-known endpoint the model server binds by default
    pub fn well_known() -> Self {
        #[cfg(unix)]
        {
            let dir = std::env::var_os("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            Endpoint::Unix(dir.join("vibevoice.sock"))
        }
        #[cfg(windows)]
        {
            Endpoint::NamedPipe(PathBuf::from(r"\\.\pipe\vibevoice"))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 50061)))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            #[cfg(windows)]
            Endpoint::NamedPipe(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr
                .parse::<SocketAddr>()
                .map(Endpoint::Tcp)
                .map_err(|e| format!("invalid TCP address '{}': {}", addr, e));
        }
        if s.is_empty() {
            return Err("endpoint cannot be empty".to_string());
        }

        #[cfg(unix)]
        {
            Ok(Endpoint::Unix(PathBuf::from(s)))
        }
        #[cfg(windows)]
        {
            Ok(Endpoint::NamedPipe(PathBuf::from(s)))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(format!("'{}' is not a tcp:// endpoint", s))
        }
    }
}

enum LocalStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(windows)]
    Pipe(std::fs::File),
}

impl LocalStream {
    /// Open the endpoint, spending at most `timeout` inside a TCP handshake
    fn open(endpoint: &Endpoint, timeout: Duration) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                // connect_timeout rejects a zero duration
                let stream =
                    TcpStream::connect_timeout(addr, timeout.max(Duration::from_millis(1)))?;
                stream.set_nodelay(true)?;
                Ok(LocalStream::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(LocalStream::Unix(UnixStream::connect(path)?)),
            #[cfg(windows)]
            Endpoint::NamedPipe(path) => {
                // Exclusive open: no share flags
                use std::os::windows::fs::OpenOptionsExt;
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .share_mode(0)
                    .open(path)?;
                Ok(LocalStream::Pipe(file))
            }
        }
    }

    fn shutdown(&self) {
        match self {
            LocalStream::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            LocalStream::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            #[cfg(windows)]
            LocalStream::Pipe(_) => {}
        }
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            LocalStream::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            LocalStream::Pipe(file) => file.read(buf),
        }
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            LocalStream::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            LocalStream::Pipe(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            LocalStream::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            LocalStream::Pipe(file) => file.flush(),
        }
    }
}

/// Whether an open failure means "server not there yet" rather than a hard error
fn endpoint_unavailable(e: &io::Error) -> bool {
    // ERROR_PIPE_BUSY: every pipe instance is taken, wait for the next one
    #[cfg(windows)]
    if e.raw_os_error() == Some(231) {
        return true;
    }

    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::WouldBlock
    )
}

/// Map a failed open to the error reported once retrying is over
fn open_failure(endpoint: &Endpoint, timeout: Duration, e: io::Error) -> TransportError {
    if e.kind() == ErrorKind::TimedOut {
        TransportError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout,
        }
    } else {
        TransportError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source: e,
        }
    }
}

/// Production transport over a local socket or named pipe
pub struct LocalSocketTransport {
    endpoint: Endpoint,
    stream: Option<LocalStream>,
    poll_interval: Duration,
}

impl LocalSocketTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// How often to retry while waiting for the endpoint to appear
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn stream(&mut self) -> Result<&mut LocalStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for LocalSocketTransport {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        debug!("📡 Connecting to model server at {}", self.endpoint);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match LocalStream::open(&self.endpoint, remaining) {
                Ok(stream) => {
                    info!("✅ Connected to model server at {}", self.endpoint);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if endpoint_unavailable(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::ConnectTimeout {
                            endpoint: self.endpoint.to_string(),
                            timeout,
                        });
                    }
                    thread::sleep(self.poll_interval.min(deadline - now));
                }
                Err(e) => return Err(open_failure(&self.endpoint, timeout, e)),
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        read_full(self.stream()?, buf)
    }

    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        write_full(self.stream()?, bytes)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
            debug!("🔌 Disconnected from {}", self.endpoint);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for LocalSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
