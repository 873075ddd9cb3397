// standard
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

// internal crates
use crate::error::Error;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;
const COMMAND_CONNECT: u8 = 0x01;
const ADDRESS_TYPE_IPV4: u8 = 0x01;
const ADDRESS_TYPE_DOMAIN: u8 = 0x03;
const ADDRESS_TYPE_IPV6: u8 = 0x04;

/// A single point in time bounding every blocking operation of a request
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Deadline {
        Deadline {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn timed_out(&self) -> Error {
        Error::RequestTimeout(self.timeout.as_millis())
    }

    /// Time left, or `RequestTimeout` once exhausted
    pub fn remaining(&self) -> Result<Duration, Error> {
        match self.timeout.checked_sub(self.start.elapsed()) {
            Some(remaining) if !remaining.is_zero() => Ok(remaining),
            _ => Err(self.timed_out()),
        }
    }

    // io failures past the deadline (or socket timeouts) are reported as timeouts
    pub fn io_error(&self, context: &str, err: std::io::Error) -> Error {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => self.timed_out(),
            _ if self.remaining().is_err() => self.timed_out(),
            _ => Error::TransportError(format!("{}: {}", context, err)),
        }
    }
}

/// Connect to `proxy_addr` and ask it to CONNECT to `host:port`. The host is
/// always sent as a domain name so name resolution happens inside tor.
pub(crate) fn connect(
    proxy_addr: &SocketAddr,
    host: &str,
    port: u16,
    deadline: &Deadline,
) -> Result<TcpStream, Error> {
    if host.is_empty() || host.len() > u8::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "host '{}' cannot be sent to a socks proxy",
            host
        )));
    }

    let mut stream = TcpStream::connect_timeout(proxy_addr, deadline.remaining()?)
        .map_err(|err| deadline.io_error("failed to connect to socks proxy", err))?;
    stream
        .set_nodelay(true)
        .map_err(|err| deadline.io_error("failed to configure socks stream", err))?;

    // greeting: no authentication
    write_all(&mut stream, &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE], deadline)?;
    let mut method = [0u8; 2];
    read_exact(&mut stream, &mut method, deadline)?;
    if method[0] != SOCKS5_VERSION {
        return Err(Error::TransportError(format!(
            "socks proxy replied with version {}",
            method[0]
        )));
    }
    match method[1] {
        AUTH_METHOD_NONE => (),
        AUTH_METHOD_NOT_ACCEPTABLE => {
            return Err(Error::TransportError(
                "socks proxy requires authentication".to_string(),
            ))
        }
        other => {
            return Err(Error::TransportError(format!(
                "socks proxy selected unsupported authentication method {:#04x}",
                other
            )))
        }
    }

    // CONNECT request
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, COMMAND_CONNECT, 0x00, ADDRESS_TYPE_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    write_all(&mut stream, &request, deadline)?;

    // reply: version, code, reserved, bound address
    let mut reply = [0u8; 4];
    read_exact(&mut stream, &mut reply, deadline)?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::TransportError(format!(
            "socks proxy replied with version {}",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(Error::TransportError(format!(
            "socks proxy could not connect to {}:{}: {}",
            host,
            port,
            reply_meaning(reply[1])
        )));
    }
    let bound_len = match reply[3] {
        ADDRESS_TYPE_IPV4 => 4,
        ADDRESS_TYPE_IPV6 => 16,
        ADDRESS_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(&mut stream, &mut len, deadline)?;
            len[0] as usize
        }
        other => {
            return Err(Error::TransportError(format!(
                "socks proxy replied with unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    read_exact(&mut stream, &mut bound, deadline)?;

    Ok(stream)
}

/// Human readable meaning of a SOCKS5 reply code, including tor's extended
/// onion service codes
pub fn reply_meaning(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        0xF0 => "onion service descriptor can not be found",
        0xF1 => "onion service descriptor is invalid",
        0xF2 => "onion service introduction failed",
        0xF3 => "onion service rendezvous failed",
        0xF4 => "onion service missing client authorization",
        0xF5 => "onion service wrong client authorization",
        0xF6 => "onion service invalid address",
        0xF7 => "onion service introduction timed out",
        _ => "unknown reply code",
    }
}

pub(crate) fn write_all(
    stream: &mut TcpStream,
    data: &[u8],
    deadline: &Deadline,
) -> Result<(), Error> {
    let mut written = 0;
    while written < data.len() {
        stream
            .set_write_timeout(Some(deadline.remaining()?))
            .map_err(|err| deadline.io_error("failed to configure stream", err))?;
        match stream.write(&data[written..]) {
            Ok(0) => {
                return Err(Error::TransportError(
                    "connection closed while writing".to_string(),
                ))
            }
            Ok(count) => written += count,
            Err(err) if err.kind() == ErrorKind::Interrupted => (),
            Err(err) => return Err(deadline.io_error("write failed", err)),
        }
    }
    Ok(())
}

/// Read some bytes; `Ok(0)` at end of stream
pub(crate) fn read_some(
    stream: &mut TcpStream,
    buffer: &mut [u8],
    deadline: &Deadline,
) -> Result<usize, Error> {
    loop {
        stream
            .set_read_timeout(Some(deadline.remaining()?))
            .map_err(|err| deadline.io_error("failed to configure stream", err))?;
        match stream.read(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if err.kind() == ErrorKind::Interrupted => (),
            Err(err) => return Err(deadline.io_error("read failed", err)),
        }
    }
}

fn read_exact(stream: &mut TcpStream, buffer: &mut [u8], deadline: &Deadline) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buffer.len() {
        match read_some(stream, &mut buffer[filled..], deadline)? {
            0 => {
                return Err(Error::TransportError(
                    "socks proxy closed the connection".to_string(),
                ))
            }
            count => filled += count,
        }
    }
    Ok(())
}

#[test]
fn test_deadline() {
    let deadline = Deadline::new(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    assert!(matches!(deadline.remaining(), Err(Error::RequestTimeout(1))));

    let deadline = Deadline::new(Duration::from_secs(30));
    assert!(deadline.remaining().is_ok());
    let err = std::io::Error::new(ErrorKind::TimedOut, "timed out");
    assert!(matches!(
        deadline.io_error("read failed", err),
        Error::RequestTimeout(30000)
    ));
    let err = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
    assert!(matches!(
        deadline.io_error("read failed", err),
        Error::TransportError(_)
    ));
}

#[test]
fn test_socks_connect_refused_by_proxy() -> anyhow::Result<()> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let proxy_addr = listener.local_addr()?;
    let proxy = std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let (mut stream, _) = listener.accept()?;
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting)?;
        stream.write_all(&[0x05, 0x00])?;
        let mut request = [0u8; 5 + 11 + 2];
        stream.read_exact(&mut request)?;
        stream.write_all(&[0x05, 0xF0, 0x00, 0x01, 0, 0, 0, 0, 0, 0])?;
        Ok(request.to_vec())
    });

    let deadline = Deadline::new(Duration::from_secs(5));
    match connect(&proxy_addr, "example.com", 80, &deadline) {
        Err(Error::TransportError(message)) => {
            assert!(message.contains("descriptor can not be found"))
        }
        _ => panic!("expected a transport error"),
    }

    let request = proxy.join().map_err(|_| anyhow::anyhow!("proxy panicked"))??;
    assert_eq!(&request[0..5], &[0x05, 0x01, 0x00, 0x03, 11]);
    assert_eq!(&request[5..16], b"example.com");
    assert_eq!(&request[16..], &80u16.to_be_bytes());
    Ok(())
}

#[test]
fn test_socks_connect_timeout() -> anyhow::Result<()> {
    use std::net::TcpListener;

    // a proxy which accepts but never answers
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let proxy_addr = listener.local_addr()?;

    let start = Instant::now();
    let deadline = Deadline::new(Duration::from_millis(50));
    assert!(matches!(
        connect(&proxy_addr, "example.com", 80, &deadline),
        Err(Error::RequestTimeout(50))
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
    drop(listener);
    Ok(())
}
