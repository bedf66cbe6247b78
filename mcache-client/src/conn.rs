//! # Server Connections
//!
//! Purpose: One buffered byte stream to one server with absolute read/write
//! deadlines, shared by TCP, Unix and UDP transports.
//!
//! ## Design Principles
//! 1. **Deadlines, Not Timeouts**: Each syscall is armed with the time left
//!    until an absolute instant, so partial reads cannot extend a request.
//! 2. **Cancellation by Slicing**: With a cancel signal bound, socket waits
//!    are cut into short slices and the signal is polled between them.
//! 3. **Single Owner**: A connection is used by one caller at a time; `&mut`
//!    receivers encode the pool's checkout discipline.
//! 4. **Graceful Close**: `close` is idempotent and best-effort sends `quit`.
//!
//! ## Layering
//!
//! ```text
//! Connection
//!   └── BufReader<DeadlineIo>
//!         └── DeadlineIo { read_deadline, write_deadline, cancel }
//!               └── Transport::{Tcp, Unix, Udp(UdpTransport)}
//! ```

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, trace};

use mcache_common::{McError, McResult, Request, Response};

use crate::addr::{Addr, Network};
use crate::context::Context;
use crate::pool::PoolConn;

/// Grace period for the `quit` sent on close.
const QUIT_DEADLINE: Duration = Duration::from_millis(100);

/// Longest single socket wait while a cancel signal is bound.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Frame header of memcached's UDP protocol: request id 1, sequence 0, one
/// datagram, reserved.
const UDP_HEADER: [u8; 8] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];

const UDP_MAX_DATAGRAM: usize = 65_507;

/// Read and write timeouts applied to a round trip.
#[derive(Debug, Clone, Copy)]
pub struct IoTimeouts {
    pub read: Duration,
    pub write: Duration,
}

/// A connected datagram socket presented as a byte stream.
///
/// Writes are buffered until `flush`, which sends one framed datagram.
/// Reads strip the frame header of every datagram received.
struct UdpTransport {
    socket: UdpSocket,
    inbound: Vec<u8>,
    pos: usize,
    outbound: Vec<u8>,
}

impl UdpTransport {
    fn new(socket: UdpSocket) -> Self {
        UdpTransport {
            socket,
            inbound: Vec::new(),
            pos: 0,
            outbound: Vec::new(),
        }
    }
}

impl Read for UdpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.inbound.len() {
            self.inbound.resize(UDP_MAX_DATAGRAM, 0);
            let n = self.socket.recv(&mut self.inbound)?;
            if n < UDP_HEADER.len() {
                self.inbound.clear();
                return Err(io::Error::new(io::ErrorKind::InvalidData, "udp datagram shorter than its frame header"));
            }
            self.inbound.truncate(n);
            self.pos = UDP_HEADER.len();
        }
        let available = &self.inbound[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for UdpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let mut datagram = Vec::with_capacity(UDP_HEADER.len() + self.outbound.len());
        datagram.extend_from_slice(&UDP_HEADER);
        datagram.extend_from_slice(&self.outbound);
        self.outbound.clear();
        self.socket.send(&datagram)?;
        Ok(())
    }
}

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Udp(UdpTransport),
}

impl Transport {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(s) => s.set_read_timeout(timeout),
            Transport::Udp(u) => u.socket.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(s) => s.set_write_timeout(timeout),
            Transport::Udp(u) => u.socket.set_write_timeout(timeout),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
            Transport::Udp(_) => Ok(()),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
            Transport::Udp(u) => u.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
            Transport::Udp(u) => u.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
            Transport::Udp(u) => u.flush(),
        }
    }
}

/// Applies absolute deadlines and cancellation to every syscall.
struct DeadlineIo {
    inner: Transport,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    cancel: Option<Receiver<()>>,
}

impl DeadlineIo {
    fn arm(&self, deadline: Option<Instant>, write: bool) -> io::Result<()> {
        let canceled = self
            .cancel
            .as_ref()
            .is_some_and(|c| matches!(c.try_recv(), Err(TryRecvError::Disconnected)));
        if canceled {
            return Err(io::Error::new(io::ErrorKind::Other, "operation canceled"));
        }

        let mut timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"));
                }
                Some(deadline - now)
            }
            None => None,
        };
        if self.cancel.is_some() {
            timeout = Some(timeout.map_or(CANCEL_POLL, |t| t.min(CANCEL_POLL)));
        }

        if write {
            self.inner.set_write_timeout(timeout)
        } else {
            self.inner.set_read_timeout(timeout)
        }
    }

    fn clear(&mut self) {
        self.read_deadline = None;
        self.write_deadline = None;
        self.cancel = None;
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl Read for DeadlineIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.arm(self.read_deadline, false)?;
            match self.inner.read(buf) {
                // Re-arming reports the deadline or the cancellation.
                Err(err) if is_timeout(&err) => continue,
                other => return other,
            }
        }
    }
}

impl Write for DeadlineIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.arm(self.write_deadline, true)?;
            match self.inner.write(buf) {
                Err(err) if is_timeout(&err) => continue,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            self.arm(self.write_deadline, true)?;
            match self.inner.flush() {
                Err(err) if is_timeout(&err) => continue,
                other => return other,
            }
        }
    }
}

/// Buffered connection to one server.
pub struct Connection {
    peer: String,
    created_at: Instant,
    returned_at: Instant,
    closed: bool,
    io: BufReader<DeadlineIo>,
}

impl Connection {
    /// Dials `addr`, bounded by `dial_timeout` and the context.
    pub fn open(addr: &Addr, dial_timeout: Duration, ctx: &Context) -> McResult<Self> {
        ctx.check()?;
        let timeout = match ctx.io_deadline(dial_timeout) {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Some(left),
                _ => return Err(McError::DeadlineExceeded),
            },
            None => None,
        };

        let transport = dial(addr, timeout).map_err(|err| ctx.classify(err))?;
        debug!(addr = %addr, "connection established");

        let now = Instant::now();
        Ok(Connection {
            peer: addr.to_string(),
            created_at: now,
            returned_at: now,
            closed: false,
            io: BufReader::new(DeadlineIo {
                inner: transport,
                read_deadline: None,
                write_deadline: None,
                cancel: None,
            }),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.io.get_mut().read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.io.get_mut().write_deadline = deadline;
    }

    /// Reads up to and including `delim`; the delimiter and a preceding `\r`
    /// are trimmed.
    pub fn read_line(&mut self, delim: u8) -> McResult<Vec<u8>> {
        self.ensure_open()?;
        let mut line = Vec::with_capacity(64);
        let n = self.io.read_until(delim, &mut line)?;
        if n == 0 || line.last() != Some(&delim) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into());
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> McResult<usize> {
        self.ensure_open()?;
        Ok(self.io.read(buf)?)
    }

    /// Writes the whole buffer and flushes it to the socket.
    pub fn write(&mut self, buf: &[u8]) -> McResult<()> {
        self.ensure_open()?;
        let io = self.io.get_mut();
        io.write_all(buf)?;
        io.flush()?;
        Ok(())
    }

    /// Sends `req` and frames its reply into `resp`.
    ///
    /// Transport failures are reported as the context error once the context
    /// is done.
    pub fn round_trip(&mut self, ctx: &Context, req: &Request, resp: &mut Response, timeouts: IoTimeouts) -> McResult<()> {
        self.ensure_open()?;
        self.io.get_mut().cancel = ctx.cancel_signal();
        self.set_write_deadline(ctx.io_deadline(timeouts.write));

        let result = self.write(req.raw()).and_then(|()| {
            self.set_read_deadline(ctx.io_deadline(timeouts.read));
            resp.recv(&mut self.io)
        });

        self.io.get_mut().clear();
        result.map_err(|err| ctx.classify(err))
    }

    /// Idempotent close. Sends `quit` best-effort before shutting down.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let io = self.io.get_mut();
        io.clear();
        io.write_deadline = Some(Instant::now() + QUIT_DEADLINE);
        if let Err(err) = io.write_all(b"quit\r\n").and_then(|()| io.flush()) {
            trace!(peer = %self.peer, error = %err, "quit not delivered");
        }
        io.inner.shutdown();
        debug!(peer = %self.peer, "connection closed");
    }

    fn ensure_open(&self) -> McResult<()> {
        if self.closed {
            Err(McError::ConnClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolConn for Connection {
    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn returned_at(&self) -> Instant {
        self.returned_at
    }

    fn mark_returned(&mut self, at: Instant) {
        self.returned_at = at;
        self.io.get_mut().clear();
    }

    fn close(&mut self) {
        Connection::close(self);
    }
}

fn dial(addr: &Addr, timeout: Option<Duration>) -> McResult<Transport> {
    match addr.network() {
        Network::Tcp => {
            let stream = connect_tcp(addr.address(), timeout)?;
            stream.set_nodelay(true)?;
            Ok(Transport::Tcp(stream))
        }
        Network::Udp => {
            let target = first_socket_addr(addr.address())?;
            let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(local)?;
            socket.connect(target)?;
            Ok(Transport::Udp(UdpTransport::new(socket)))
        }
        #[cfg(unix)]
        Network::Unix => Ok(Transport::Unix(UnixStream::connect(addr.address())?)),
        #[cfg(not(unix))]
        Network::Unix => Err(McError::NotSupported("unix sockets on this platform".into())),
    }
}

fn connect_tcp(address: &str, timeout: Option<Duration>) -> McResult<TcpStream> {
    let mut last_err = None;
    for target in address.to_socket_addrs()? {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&target, timeout),
            None => TcpStream::connect(target),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Err(McError::InvalidAddress(format!("{address} resolved to no socket address"))),
    }
}

fn first_socket_addr(address: &str) -> McResult<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| McError::InvalidAddress(format!("{address} resolved to no socket address")))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use mcache_common::version_command;

    use super::*;

    fn tcp_addr(listener: &TcpListener) -> Addr {
        Addr::new(Network::Tcp, listener.local_addr().unwrap().to_string(), 0)
    }

    const TIMEOUTS: IoTimeouts = IoTimeouts {
        read: Duration::from_secs(2),
        write: Duration::from_secs(2),
    };

    #[test]
    fn round_trip_and_quit_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "version\r\n");
            (&stream).write_all(b"VERSION 1.6.14\r\n").unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            line
        });

        let ctx = Context::background();
        let mut conn = Connection::open(&addr, Duration::from_secs(1), &ctx).unwrap();
        let (req, mut resp) = version_command();
        conn.round_trip(&ctx, &req, &mut resp, TIMEOUTS).unwrap();
        assert_eq!(resp.lines()[0].as_ref(), b"VERSION 1.6.14");

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(conn.write(b"x"), Err(McError::ConnClosed)));
        assert_eq!(server.join().unwrap(), "quit\r\n");
    }

    #[test]
    fn read_line_trims_line_endings() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"first\r\nsecond\n").unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let mut conn = Connection::open(&addr, Duration::from_secs(1), &Context::background()).unwrap();
        assert_eq!(conn.read_line(b'\n').unwrap(), b"first");
        assert_eq!(conn.read_line(b'\n').unwrap(), b"second");
        server.join().unwrap();
    }

    #[test]
    fn context_deadline_bounds_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(400));
            drop(stream);
        });

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let mut conn = Connection::open(&addr, Duration::from_secs(1), &ctx).unwrap();
        let (req, mut resp) = version_command();
        let started = Instant::now();
        let err = conn.round_trip(&ctx, &req, &mut resp, TIMEOUTS).unwrap_err();
        assert!(matches!(err, McError::DeadlineExceeded), "{err}");
        assert!(started.elapsed() < Duration::from_millis(350));
        server.join().unwrap();
    }

    #[test]
    fn read_timeout_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let ctx = Context::background();
        let mut conn = Connection::open(&addr, Duration::from_secs(1), &ctx).unwrap();
        let (req, mut resp) = version_command();
        let timeouts = IoTimeouts { read: Duration::from_millis(50), write: Duration::from_secs(1) };
        let err = conn.round_trip(&ctx, &req, &mut resp, timeouts).unwrap_err();
        assert!(matches!(err, McError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn cancellation_interrupts_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let (ctx, handle) = Context::background().with_cancel();
        let mut conn = Connection::open(&addr, Duration::from_secs(1), &ctx).unwrap();
        let canceler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.cancel();
        });
        let (req, mut resp) = version_command();
        let err = conn.round_trip(&ctx, &req, &mut resp, TIMEOUTS).unwrap_err();
        assert!(matches!(err, McError::Canceled), "{err}");
        canceler.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn udp_frames_every_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = Addr::new(Network::Udp, server.local_addr().unwrap().to_string(), 0);
        let ctx = Context::background();
        let mut conn = Connection::open(&addr, Duration::from_secs(1), &ctx).unwrap();

        let echo = thread::spawn(move || {
            let mut buf = [0u8; 1500];
            let (n, peer) = server.recv_from(&mut buf).unwrap();
            let mut reply = UDP_HEADER.to_vec();
            reply.extend_from_slice(b"VERSION 1.6.14\r\n");
            server.send_to(&reply, peer).unwrap();
            buf[..n].to_vec()
        });

        let (req, mut resp) = version_command();
        conn.round_trip(&ctx, &req, &mut resp, TIMEOUTS).unwrap();
        assert_eq!(resp.lines()[0].as_ref(), b"VERSION 1.6.14");

        let sent = echo.join().unwrap();
        assert_eq!(&sent[..8], &UDP_HEADER);
        assert_eq!(&sent[8..], b"version\r\n");
    }

    #[test]
    fn dial_failure_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp_addr(&listener);
        drop(listener);
        let err = Connection::open(&addr, Duration::from_millis(200), &Context::background()).err();
        assert!(matches!(err, Some(McError::Io(_))));
    }
}
