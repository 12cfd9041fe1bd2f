use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::ModbusError;
use crate::codec::RESPONSE_BUFFER_LEN;

/// MBAP bytes preceding the length-delimited remainder of a frame.
const MBAP_PREFIX_LEN: usize = 6;

/// How a response is pulled off the socket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResponseRead {
    /// One blocking read; whatever arrives is the response. A frame split
    /// across TCP segments comes back short and fails decoding.
    #[default]
    SingleRead,
    /// Read the 6-byte MBAP prefix, then exactly `length` more bytes.
    Framed,
}

/// Owns the single TCP connection to a Modbus server.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport {
            stream: None,
            buffer: vec![0u8; RESPONSE_BUFFER_LEN],
        }
    }

    /// Connects to `host:port`, closing any existing connection first.
    ///
    /// A timed-out attempt is retried up to `retries` more times. Any other
    /// I/O failure is returned immediately.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        retries: u32,
        response_timeout: Option<Duration>,
    ) -> Result<(), ModbusError> {
        self.disconnect();

        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(ModbusError::ConnectionFailure(format!(
                "{host}:{port} did not resolve to any address"
            )));
        }

        let stream = retry_on_timeout(retries, |attempt| {
            debug!(attempt, host, port, "Connecting to Modbus TCP server");
            connect_any(&addrs, connect_timeout)
        })?;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(response_timeout)?;

        info!(host, port, peer = ?stream.peer_addr().ok(), "Connected to Modbus TCP server");
        self.stream = Some(stream);
        Ok(())
    }

    /// Closes the socket if there is one. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone; the socket is dropped either way.
            let _ = stream.shutdown(Shutdown::Both);
            info!("Disconnected from Modbus TCP server");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.peer_addr().is_ok())
    }

    pub fn set_response_timeout(&self, timeout: Option<Duration>) -> Result<(), ModbusError> {
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    /// Writes the whole request, then reads one response according to `mode`.
    ///
    /// Returns only the bytes actually read; an empty vector means the peer
    /// closed the stream. Any failure, or a closed stream, drops the
    /// connection so no late reply stays queued for the next request.
    pub fn send_and_receive(
        &mut self,
        request: &[u8],
        mode: ResponseRead,
    ) -> Result<Vec<u8>, ModbusError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::ConnectionFailure("socket is null".into()))?;

        let len = match exchange(stream, request, mode, &mut self.buffer) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "Request failed, closing connection");
                self.disconnect();
                return Err(e);
            }
        };

        let response = self.buffer[..len].to_vec();
        trace!(frame = ?response, "Received response frame");
        if response.is_empty() {
            self.disconnect();
        }
        Ok(response)
    }
}

fn exchange(
    stream: &mut TcpStream,
    request: &[u8],
    mode: ResponseRead,
    buffer: &mut [u8],
) -> Result<usize, ModbusError> {
    trace!(frame = ?request, "Sending request frame");
    stream.write_all(request).map_err(map_io_error)?;

    match mode {
        ResponseRead::SingleRead => stream.read(buffer).map_err(map_io_error),
        ResponseRead::Framed => read_frame(stream, buffer),
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Runs `attempt` until it succeeds, fails with something other than a
/// timeout, or `retries + 1` attempts have timed out.
fn retry_on_timeout<T, F>(retries: u32, mut attempt: F) -> Result<T, ModbusError>
where
    F: FnMut(u32) -> io::Result<T>,
{
    let mut remaining = retries;
    let mut number = 1;

    loop {
        match attempt(number) {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(attempt = number, remaining, "Connect attempt timed out");
                if remaining == 0 {
                    return Err(ModbusError::ConnectionFailure("retries ended".into()));
                }
                remaining -= 1;
                number += 1;
                thread::yield_now();
            }
            Err(e) => return Err(ModbusError::Io(e)),
        }
    }
}

fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> io::Result<TcpStream> {
    let mut errors = Vec::with_capacity(addrs.len());
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => errors.push(e),
        }
    }
    Err(attempt_error(errors))
}

/// An attempt timed out only if every address timed out; otherwise the first
/// other failure is what the caller sees.
fn attempt_error(errors: Vec<io::Error>) -> io::Error {
    let mut timeout = None;
    for e in errors {
        if e.kind() != io::ErrorKind::TimedOut {
            return e;
        }
        if timeout.is_none() {
            timeout = Some(e);
        }
    }
    timeout.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))
}

fn read_frame(stream: &mut TcpStream, buffer: &mut [u8]) -> Result<usize, ModbusError> {
    let prefix = &mut buffer[..MBAP_PREFIX_LEN];
    match stream.read_exact(prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
        Err(e) => return Err(map_io_error(e)),
    }

    let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
    let total = MBAP_PREFIX_LEN + length;
    if total > buffer.len() {
        return Err(ModbusError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared frame length {total} exceeds {} bytes", buffer.len()),
        )));
    }

    match stream.read_exact(&mut buffer[MBAP_PREFIX_LEN..total]) {
        Ok(()) => Ok(total),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ModbusError::ConnectionFailure(
            "stream closed in the middle of a frame".into(),
        )),
        Err(e) => Err(map_io_error(e)),
    }
}

fn map_io_error(e: io::Error) -> ModbusError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ModbusError::Timeout,
        _ => ModbusError::Io(e),
    }
}
