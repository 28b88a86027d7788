//! Low-level byte-stream backends behind [`crate::Link`]. Mirrors the
//! source project's split between a `SerialPort`/`TcpPort` trait and real vs.
//! mock implementations (`communication/serial.rs`, `communication/tcp.rs`).

use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// A raw duplex byte stream: exactly what `Link` needs, nothing more.
pub trait ByteStream: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self) -> io::Result<()>;
}

/// Real serial port backend using the `serialport` crate.
pub struct SerialStream {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialStream {
    pub fn open(path: &str, baud_rate: u32, dtr: bool, timeout: Duration) -> io::Result<Self> {
        let mut port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        port.write_data_terminal_ready(dtr)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self { port })
    }
}

impl ByteStream for SerialStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port.write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A read timeout with no bytes is not EOF; let the caller retry.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Real TCP backend using `std::net::TcpStream`.
pub struct TcpStreamBackend {
    stream: TcpStream,
}

impl TcpStreamBackend {
    pub fn connect(address: &str, timeout: Duration) -> io::Result<Self> {
        let addr = address
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ByteStream for TcpStreamBackend {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.stream.write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}

/// In-memory backend for tests, grounded in the source project's
/// `MockSerialPort`.
pub struct MockStream {
    pub to_read: std::collections::VecDeque<u8>,
    pub written: Vec<u8>,
    pub eof: bool,
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            to_read: std::collections::VecDeque::new(),
            written: Vec::new(),
            eof: false,
        }
    }

    pub fn push_incoming(&mut self, data: &[u8]) {
        self.to_read.extend(data.iter().copied());
    }
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for MockStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.to_read.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.to_read.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
