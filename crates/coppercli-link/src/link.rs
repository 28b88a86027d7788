//! `Link` (§4.1): a bidirectional byte stream to the controller with
//! line-oriented reads. The only component permitted to hold an OS handle.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use coppercli_core::error::TransportError;
use coppercli_core::Error;

use crate::backend::{ByteStream, MockStream, SerialStream, TcpStreamBackend};

/// Parameters for opening a serial link.
#[derive(Debug, Clone)]
pub struct SerialParams {
    pub port: String,
    pub baud_rate: u32,
    pub dtr: bool,
    pub timeout: Duration,
}

/// Parameters for opening a TCP link.
#[derive(Debug, Clone)]
pub struct TcpParams {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

/// A line-oriented byte stream to the controller. Lines are CRLF or
/// LF-terminated on the wire (§6); `read_line` strips the terminator.
pub struct Link {
    stream: Mutex<Option<Box<dyn ByteStream>>>,
    read_buf: Mutex<Vec<u8>>,
}

impl Link {
    fn from_stream(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            read_buf: Mutex::new(Vec::new()),
        }
    }

    /// Open a serial connection. Failure variants: `Unauthorized`,
    /// `PortInUse`, `InvalidPort`, `Io`.
    pub fn open_serial(params: &SerialParams) -> Result<Self, Error> {
        if params.port.is_empty() {
            return Err(TransportError::InvalidPort {
                port: params.port.clone(),
            }
            .into());
        }
        match SerialStream::open(&params.port, params.baud_rate, params.dtr, params.timeout) {
            Ok(s) => Ok(Self::from_stream(Box::new(s))),
            Err(e) => Err(classify_serial_error(&params.port, e)),
        }
    }

    /// Open a TCP connection. Failure variants: `InvalidAddress`,
    /// `ConnectRefused`, `Io`.
    pub fn open_tcp(params: &TcpParams) -> Result<Self, Error> {
        let address = format!("{}:{}", params.host, params.port);
        match TcpStreamBackend::connect(&address, params.timeout) {
            Ok(s) => Ok(Self::from_stream(Box::new(s))),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(TransportError::InvalidAddress { address }.into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(TransportError::ConnectRefused { address }.into())
            }
            Err(e) => Err(TransportError::Io {
                message: e.to_string(),
            }
            .into()),
        }
    }

    /// Build a link over an in-memory mock stream, for tests.
    pub fn from_mock(mock: MockStream) -> Self {
        Self::from_stream(Box::new(mock))
    }

    /// Write raw bytes to the link.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut guard = self.stream.lock().unwrap();
        match guard.as_mut() {
            Some(s) => {
                s.write(bytes).map_err(|e| Error::from(e))?;
                Ok(())
            }
            None => Err(TransportError::Io {
                message: "link is closed".into(),
            }
            .into()),
        }
    }

    /// Read one line, bounded by `timeout`. Returns `Some(line)` on success,
    /// `None` if the remote closed (EOF), or a failure on I/O error.
    pub fn read_line(&self, timeout: Duration) -> Result<Option<String>, Error> {
        let deadline = Instant::now() + timeout;
        let mut buf = self.read_buf.lock().unwrap();

        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = buf.drain(..=pos).collect();
                line.pop(); // trailing \n
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).to_string()));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let mut chunk = [0u8; 512];
            let n = {
                let mut guard = self.stream.lock().unwrap();
                match guard.as_mut() {
                    Some(s) => s.read(&mut chunk).map_err(Error::from)?,
                    None => return Ok(None),
                }
            };

            if n == 0 {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Close the link. Idempotent; guarantees release of the OS handle.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.stream.lock().unwrap();
        if let Some(mut s) = guard.take() {
            let _ = s.close();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.stream.lock().unwrap().is_none()
    }
}

fn classify_serial_error(port: &str, e: std::io::Error) -> Error {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        TransportError::Unauthorized {
            port: port.to_string(),
        }
        .into()
    } else if lower.contains("busy") || lower.contains("in use") {
        TransportError::PortInUse {
            port: port.to_string(),
        }
        .into()
    } else if lower.contains("no such file") || lower.contains("not found") {
        TransportError::InvalidPort {
            port: port.to_string(),
        }
        .into()
    } else {
        TransportError::Io { message }.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockStream;

    #[test]
    fn reads_a_single_lf_line() {
        let mut mock = MockStream::new();
        mock.push_incoming(b"ok\n");
        let link = Link::from_mock(mock);
        let line = link.read_line(Duration::from_millis(50)).unwrap();
        assert_eq!(line.as_deref(), Some("ok"));
    }

    #[test]
    fn strips_crlf() {
        let mut mock = MockStream::new();
        mock.push_incoming(b"ok\r\n");
        let link = Link::from_mock(mock);
        let line = link.read_line(Duration::from_millis(50)).unwrap();
        assert_eq!(line.as_deref(), Some("ok"));
    }

    #[test]
    fn times_out_with_no_data() {
        let mock = MockStream::new();
        let link = Link::from_mock(mock);
        let line = link.read_line(Duration::from_millis(20)).unwrap();
        assert_eq!(line, None);
    }

    #[test]
    fn close_is_idempotent() {
        let mock = MockStream::new();
        let link = Link::from_mock(mock);
        link.close().unwrap();
        link.close().unwrap();
        assert!(link.is_closed());
    }

    #[test]
    fn buffers_partial_lines_across_reads() {
        let mut mock = MockStream::new();
        mock.push_incoming(b"<Idle");
        let link = Link::from_mock(mock);
        assert_eq!(link.read_line(Duration::from_millis(20)).unwrap(), None);
    }
}
