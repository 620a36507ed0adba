//! Blocking TCP connection wrapper.
//!
//! One [`Connection`] wraps one `TcpStream`. The peer layer clones off a
//! read half per connection so a dedicated reader thread can block on
//! frames while writers serialize behind the peer's send lock.

use {
    crate::error::{CommError, Result},
    log::{debug, warn},
    std::{
        io::{Read, Write},
        net::{TcpStream, ToSocketAddrs},
        time::Duration,
    },
};

/// Append the default port when `addr` carries none.
///
/// Accepts `host` or `host:port`; bare IPv6 addresses are not supported by
/// the description language and are not special-cased here.
pub fn normalize_addr(addr: &str, default_port: u16) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    }
}

/// A live TCP stream to one remote process.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    /// Address string the stream was established against.
    addr: String,
    /// True when we dialed; false for accepted connections.
    outbound: bool,
}

impl Connection {
    /// Dial `addr`, retrying up to `attempts` times with `retry_ms`
    /// between tries. Every failed attempt is logged.
    pub fn dial(addr: &str, attempts: u32, retry_ms: u64) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 1..=attempts.max(1) {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("connected to {addr} (attempt {attempt})");
                    return Ok(Self {
                        stream,
                        addr: addr.to_string(),
                        outbound: true,
                    });
                }
                Err(e) => {
                    warn!("dial {addr} failed (attempt {attempt}/{attempts}): {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(Duration::from_millis(retry_ms));
                    }
                }
            }
        }
        Err(last_err
            .map(CommError::Io)
            .unwrap_or(CommError::ConnectionClosed))
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Ok(Self {
            stream,
            addr,
            outbound: false,
        })
    }

    /// Address string of the remote end.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True when this end initiated the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Replace the recorded remote address. Used when a peer announces the
    /// listener port it can be dialed back on.
    pub fn set_addr(&mut self, addr: String) {
        self.addr = addr;
    }

    /// Bound subsequent reads; `None` restores indefinite blocking.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Clone a read half sharing the underlying socket.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            addr: self.addr.clone(),
            outbound: self.outbound,
        })
    }

    /// Shut down both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Local socket address, useful for tests binding ephemeral ports.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.stream.local_addr()?)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

/// Resolve an address string early so bad input fails at the call site
/// instead of inside a retry loop.
pub fn check_resolvable(addr: &str) -> Result<()> {
    addr.to_socket_addrs()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::wire::Message,
        std::net::TcpListener,
    };

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("10.0.0.1", 10001), "10.0.0.1:10001");
        assert_eq!(normalize_addr("10.0.0.1:80", 10001), "10.0.0.1:80");
        assert_eq!(normalize_addr("localhost", 7), "localhost:7");
    }

    #[test]
    fn test_dial_and_frame_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Connection::from_stream(stream).unwrap();
            let m = Message::read_from(&mut conn, 1 << 20).unwrap();
            m.write_to(&mut conn).unwrap();
        });

        let mut conn = Connection::dial(&addr, 3, 10).unwrap();
        assert!(conn.is_outbound());
        let sent = Message::with_payload(1, 2, 3, b"ping".to_vec());
        sent.write_to(&mut conn).unwrap();
        let echoed = Message::read_from(&mut conn, 1 << 20).unwrap();
        assert_eq!(echoed, sent);
        server.join().unwrap();
    }

    #[test]
    fn test_dial_failure_after_retries() {
        // Bind then drop to get a port that refuses connections.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = Connection::dial(&format!("127.0.0.1:{port}"), 2, 1).unwrap_err();
        assert!(matches!(err, CommError::Io(_)));
    }

    #[test]
    fn test_closed_stream_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let mut conn = Connection::dial(&addr, 1, 1).unwrap();
        server.join().unwrap();
        let err = Message::read_from(&mut conn, 1 << 20).unwrap_err();
        assert!(err.is_disconnect());
    }
}
