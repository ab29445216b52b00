use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

/// A lazily-connecting TCP stream for device channels (e.g. a
/// serial-over-TCP bridge). Connects on first use, applies read/write
/// timeouts, and transparently reconnects when the peer resets the
/// connection.
pub struct LazyTcpStream {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    max_retries: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    connect_timeout: Duration,
}

impl LazyTcpStream {
    pub fn new(
        addr: SocketAddr,
        max_retries: u32,
        read_timeout: Duration,
        write_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        LazyTcpStream {
            addr,
            stream: None,
            max_retries,
            read_timeout,
            write_timeout,
            connect_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&mut self) -> io::Result<()> {
        for attempt in 0..=self.max_retries {
            match TcpStream::connect_timeout(&self.addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_write_timeout(Some(self.write_timeout))?;

                    debug!(addr = %self.addr, attempt, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if attempt == self.max_retries => {
                    warn!(addr = %self.addr, "connection failed: {}", e);
                    return Err(e);
                }
                Err(_) => {}
            }
        }

        Err(io::Error::other("max connection retries reached"))
    }

    fn ensure_connected(&mut self) -> io::Result<()> {
        if self.stream.is_none() {
            self.connect()?;
        }
        Ok(())
    }

    pub fn reconnect(&mut self) -> io::Result<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.connect()
    }

    fn drop_broken(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl Read for LazyTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_connected()?;

        match self.stream.as_mut().expect("connected stream").read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_disconnect(e.kind()) => {
                warn!(addr = %self.addr, "read failed, reconnecting: {}", e);
                self.drop_broken();
                self.connect()?;
                self.stream.as_mut().expect("connected stream").read(buf)
            }
            Err(e) => Err(e),
        }
    }
}

impl Write for LazyTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_connected()?;

        match self.stream.as_mut().expect("connected stream").write(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_disconnect(e.kind()) => {
                warn!(addr = %self.addr, "write failed, reconnecting: {}", e);
                self.drop_broken();
                self.connect()?;
                self.stream.as_mut().expect("connected stream").write(buf)
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_connected()?;
        self.stream.as_mut().expect("connected stream").flush()
    }
}
