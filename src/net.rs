//! Blocking TCP helpers shared by the connector and the relay.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Opens a TCP connection to `host:port`.
///
/// Every resolved address is tried in turn. With a timeout each attempt is
/// bounded by it; the last error is returned if all of them fail.
pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let Some(timeout) = timeout else {
        return TcpStream::connect((host, port));
    };

    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No addresses resolved for {}:{}", host, port),
        )
    }))
}

/// Shuts down both halves and drops the stream, ignoring errors.
pub fn close_quietly(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}
