// standard
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

// extern crates
use url::{Host, Url};

// internal crates
use crate::error::Error;
use crate::socks;
use crate::socks::Deadline;

/// Request timeout used when none (or zero) is supplied
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// upper bound on the status line plus headers of a response
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
// upper bound on a decoded response body
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Only POST and PUT carry a request body
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a JSON object of string values into header pairs. Empty (or all
/// whitespace) text means no headers.
pub fn parse_headers_json(json: &str) -> Result<Vec<(String, String)>, Error> {
    if json.trim().is_empty() {
        return Ok(Default::default());
    }

    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|err| Error::MalformedHeaders(err.to_string()))?;
    let object = match value {
        serde_json::Value::Object(object) => object,
        _ => {
            return Err(Error::MalformedHeaders(
                "headers must be a JSON object".to_string(),
            ))
        }
    };

    let mut headers: Vec<(String, String)> = Vec::with_capacity(object.len());
    for (name, value) in object {
        let value = match value {
            serde_json::Value::String(value) => value,
            _ => {
                return Err(Error::MalformedHeaders(format!(
                    "value of header '{}' is not a string",
                    name
                )))
            }
        };
        validate_header(&name, &value)?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn validate_header(name: &str, value: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::MalformedHeaders("empty header name".to_string()));
    }
    if name
        .chars()
        .any(|c| c.is_ascii_whitespace() || c.is_ascii_control() || c == ':')
    {
        return Err(Error::MalformedHeaders(format!(
            "invalid header name '{}'",
            name.escape_default()
        )));
    }
    if value.contains(['\r', '\n']) {
        return Err(Error::MalformedHeaders(format!(
            "value of header '{}' contains a line break",
            name
        )));
    }
    Ok(())
}

/// An HTTP/1.1 request to be sent through the tor SOCKS proxy
#[derive(Clone, Debug)]
pub struct HttpRequest {
    method: HttpMethod,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    timeout: Duration,
}

impl HttpRequest {
    pub fn new<S: Into<String>>(method: HttpMethod, url: S) -> HttpRequest {
        HttpRequest {
            method,
            url: url.into(),
            headers: Default::default(),
            body: Default::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Add the headers of a JSON object, see [`parse_headers_json`]
    pub fn with_headers_json(mut self, json: &str) -> Result<HttpRequest, Error> {
        self.headers.extend(parse_headers_json(json)?);
        Ok(self)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<HttpRequest, Error> {
        validate_header(name, value)?;
        self.headers.push((name.to_string(), value.to_string()));
        Ok(self)
    }

    /// Ignored unless the method is POST or PUT
    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> HttpRequest {
        self.body = body.into();
        self
    }

    /// Bounds the whole request: proxy connect, handshake and transfer. Zero
    /// selects [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> HttpRequest {
        self.timeout = if timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn serialize(&self, target: &Target) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\n",
            self.method.as_str(),
            target.path_and_query
        );

        let has_header = |name: &str| {
            self.headers
                .iter()
                .any(|(key, _)| key.eq_ignore_ascii_case(name))
        };
        if !has_header("host") {
            head.push_str(&format!("Host: {}\r\n", target.host_header));
        }
        head.push_str("Connection: close\r\n");
        for (name, value) in self.headers.iter() {
            // message framing is ours
            if ["connection", "content-length", "transfer-encoding"]
                .iter()
                .any(|framing| name.eq_ignore_ascii_case(framing))
            {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if self.method.sends_body() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if self.method.sends_body() {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header named `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

// where a request goes
#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    host_header: String,
    path_and_query: String,
}

impl Target {
    fn parse(url: &str) -> Result<Target, Error> {
        let url = Url::parse(url)
            .map_err(|err| Error::InvalidArgument(format!("invalid url '{}': {}", url, err)))?;
        if url.scheme() != "http" {
            return Err(Error::InvalidArgument(format!(
                "unsupported url scheme '{}', only http:// urls are supported",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(Error::InvalidArgument(format!(
                    "url '{}' has no host",
                    url
                )))
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let host_header = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => host.clone(),
        };
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Target {
            host,
            port,
            host_header,
            path_and_query,
        })
    }
}

/// Send `request` through the SOCKS5 proxy at `proxy_addr` and read the
/// complete response
pub fn send(proxy_addr: &SocketAddr, request: &HttpRequest) -> Result<HttpResponse, Error> {
    let deadline = Deadline::new(request.timeout);
    let target = Target::parse(&request.url)?;

    tracing::debug!(method = %request.method, url = %request.url, "sending http request through tor");

    let mut stream = socks::connect(proxy_addr, &target.host, target.port, &deadline)?;
    socks::write_all(&mut stream, &request.serialize(&target), &deadline)?;
    let response = read_response(&mut stream, request.method, &deadline)?;

    tracing::debug!(
        method = %request.method,
        url = %request.url,
        status_code = response.status_code,
        body_len = response.body.len(),
        "received http response"
    );
    Ok(response)
}

// Buffered reads from the stream, each bounded by the deadline
struct ResponseReader<'a> {
    stream: &'a mut TcpStream,
    deadline: &'a Deadline,
    buffer: Vec<u8>,
    eof: bool,
}

impl<'a> ResponseReader<'a> {
    // returns false at end of stream
    fn fill(&mut self) -> Result<bool, Error> {
        if self.eof {
            return Ok(false);
        }
        let len = self.buffer.len();
        self.buffer.resize(len + READ_CHUNK_SIZE, 0u8);
        let count = match socks::read_some(self.stream, &mut self.buffer[len..], self.deadline) {
            Ok(count) => count,
            Err(err) => {
                self.buffer.truncate(len);
                return Err(err);
            }
        };
        self.buffer.truncate(len + count);
        if count == 0 {
            self.eof = true;
        }
        Ok(count > 0)
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.buffer.split_off(count);
        std::mem::replace(&mut self.buffer, rest)
    }

    // status code and headers of the next response head
    fn read_head(&mut self) -> Result<(u16, Vec<(String, String)>), Error> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            let parsed = match response.parse(&self.buffer) {
                Ok(httparse::Status::Complete(len)) => {
                    let status_code = response.code.unwrap_or_default();
                    let headers: Vec<(String, String)> = response
                        .headers
                        .iter()
                        .map(|header| {
                            (
                                header.name.to_string(),
                                String::from_utf8_lossy(header.value).trim().to_string(),
                            )
                        })
                        .collect();
                    Some((len, status_code, headers))
                }
                Ok(httparse::Status::Partial) => None,
                Err(err) => {
                    return Err(Error::TransportError(format!(
                        "invalid response head: {}",
                        err
                    )))
                }
            };

            if let Some((len, status_code, headers)) = parsed {
                self.take(len);
                return Ok((status_code, headers));
            }
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::TransportError(
                    "response headers too large".to_string(),
                ));
            }
            if !self.fill()? {
                return Err(Error::TransportError(if self.buffer.is_empty() {
                    "connection closed before a response was received".to_string()
                } else {
                    "connection closed while reading response headers".to_string()
                }));
            }
        }
    }

    fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(end) = find(&self.buffer, b"\r\n") {
                let line = self.take(end + 2);
                return Ok(String::from_utf8_lossy(&line[..end]).to_string());
            }
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::TransportError(
                    "chunked body line too large".to_string(),
                ));
            }
            if !self.fill()? {
                return Err(Error::TransportError(
                    "connection closed while reading chunked body".to_string(),
                ));
            }
        }
    }

    fn read_exact(&mut self, count: usize) -> Result<Vec<u8>, Error> {
        while self.buffer.len() < count {
            if !self.fill()? {
                return Err(Error::TransportError(format!(
                    "connection closed after {} of {} body bytes",
                    self.buffer.len(),
                    count
                )));
            }
        }
        Ok(self.take(count))
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        while self.fill()? {
            check_body_size(self.buffer.len())?;
        }
        Ok(std::mem::take(&mut self.buffer))
    }

    // size line of the next chunk, extensions included
    fn read_chunk_size(&mut self) -> Result<usize, Error> {
        loop {
            match httparse::parse_chunk_size(&self.buffer) {
                Ok(httparse::Status::Complete((len, size))) => {
                    self.take(len);
                    return usize::try_from(size).map_err(|_| body_too_large());
                }
                Ok(httparse::Status::Partial) => (),
                Err(_) => return Err(Error::TransportError("invalid chunk size".to_string())),
            }
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::TransportError("invalid chunk size".to_string()));
            }
            if !self.fill()? {
                return Err(Error::TransportError(
                    "connection closed while reading chunked body".to_string(),
                ));
            }
        }
    }

    fn read_chunked(&mut self) -> Result<Vec<u8>, Error> {
        let mut body: Vec<u8> = Default::default();
        loop {
            let size = self.read_chunk_size()?;
            if size == 0 {
                break;
            }
            check_body_size(body.len().saturating_add(size))?;
            body.extend(self.read_exact(size)?);
            if self.read_exact(2)? != b"\r\n" {
                return Err(Error::TransportError(
                    "chunk not terminated by CRLF".to_string(),
                ));
            }
        }
        // trailers up to the final empty line
        while !self.read_line()?.is_empty() {}
        Ok(body)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn body_too_large() -> Error {
    Error::TransportError(format!(
        "response body exceeds {} bytes",
        MAX_BODY_SIZE
    ))
}

fn check_body_size(len: usize) -> Result<(), Error> {
    if len > MAX_BODY_SIZE {
        Err(body_too_large())
    } else {
        Ok(())
    }
}

pub(crate) fn read_response(
    stream: &mut TcpStream,
    method: HttpMethod,
    deadline: &Deadline,
) -> Result<HttpResponse, Error> {
    let mut reader = ResponseReader {
        stream,
        deadline,
        buffer: Default::default(),
        eof: false,
    };

    // skip interim responses (100 Continue and friends)
    let (status_code, headers) = loop {
        let (status_code, headers) = reader.read_head()?;
        if (100..200).contains(&status_code) && status_code != 101 {
            continue;
        }
        break (status_code, headers);
    };
    let response = HttpResponse {
        status_code,
        headers,
        body: Default::default(),
    };

    let no_body = method == HttpMethod::Head
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304;
    if no_body {
        return Ok(response);
    }

    let chunked = response
        .header("transfer-encoding")
        .map_or(false, |encoding| {
            encoding
                .rsplit(',')
                .next()
                .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
        });
    let body = if chunked {
        reader.read_chunked()?
    } else if let Some(content_length) = response.header("content-length") {
        let content_length: usize = content_length.parse().map_err(|_| {
            Error::TransportError(format!("invalid Content-Length '{}'", content_length))
        })?;
        check_body_size(content_length)?;
        reader.read_exact(content_length)?
    } else {
        reader.read_to_end()?
    };

    Ok(HttpResponse { body, ..response })
}

#[cfg(test)]
fn serve_once(response: &'static [u8]) -> anyhow::Result<(TcpStream, std::thread::JoinHandle<()>)> {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let _ = stream.write_all(response);
        }
    });
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n")?;
    Ok((stream, server))
}

#[test]
fn test_parse_headers_json() -> anyhow::Result<()> {
    assert!(parse_headers_json("")?.is_empty());
    assert!(parse_headers_json("  \n")?.is_empty());
    assert!(parse_headers_json("{}")?.is_empty());

    let mut headers = parse_headers_json(r#"{"Accept": "text/html", "X-Test": "1"}"#)?;
    headers.sort();
    assert_eq!(
        headers,
        vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("X-Test".to_string(), "1".to_string())
        ]
    );

    for malformed in [
        "not json",
        "[]",
        r#""text""#,
        r#"{"X-Number": 1}"#,
        r#"{"X-Null": null}"#,
        r#"{"": "empty"}"#,
        r#"{"X-Split": "a\r\nInjected: b"}"#,
        r#"{"Bad Name": "a"}"#,
    ] {
        assert!(
            matches!(parse_headers_json(malformed), Err(Error::MalformedHeaders(_))),
            "accepted {}",
            malformed
        );
    }
    Ok(())
}

#[test]
fn test_request_target() -> anyhow::Result<()> {
    let target = Target::parse("http://example.com/a/b?c=d&e")?;
    assert_eq!(
        target,
        Target {
            host: "example.com".to_string(),
            port: 80,
            host_header: "example.com".to_string(),
            path_and_query: "/a/b?c=d&e".to_string(),
        }
    );

    let target = Target::parse("http://abc.onion:8080")?;
    assert_eq!(target.port, 8080);
    assert_eq!(target.host_header, "abc.onion:8080");
    assert_eq!(target.path_and_query, "/");

    for invalid in ["https://example.com/", "ftp://example.com/", "example.com", "http://"] {
        assert!(
            matches!(Target::parse(invalid), Err(Error::InvalidArgument(_))),
            "accepted {}",
            invalid
        );
    }
    Ok(())
}

#[test]
fn test_request_serialization() -> anyhow::Result<()> {
    let target = Target::parse("http://example.com:8080/submit?x=1")?;

    let request = HttpRequest::new(HttpMethod::Post, "http://example.com:8080/submit?x=1")
        .with_headers_json(r#"{"Content-Type": "application/json", "Content-Length": "999"}"#)?
        .with_body("{\"a\":1}");
    assert_eq!(
        String::from_utf8(request.serialize(&target))?,
        "POST /submit?x=1 HTTP/1.1\r\nHost: example.com:8080\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}"
    );

    // body ignored, caller's Host wins
    let request = HttpRequest::new(HttpMethod::Get, "http://example.com:8080/submit?x=1")
        .with_header("Host", "other.example")?
        .with_body("ignored");
    assert_eq!(
        String::from_utf8(request.serialize(&target))?,
        "GET /submit?x=1 HTTP/1.1\r\nConnection: close\r\nHost: other.example\r\n\r\n"
    );

    // an empty PUT still announces its length
    let request = HttpRequest::new(HttpMethod::Put, "http://example.com/");
    assert!(String::from_utf8(request.serialize(&target))?.contains("Content-Length: 0\r\n"));

    assert_eq!(
        HttpRequest::new(HttpMethod::Get, "http://example.com/")
            .with_timeout(Duration::ZERO)
            .timeout(),
        DEFAULT_REQUEST_TIMEOUT
    );
    Ok(())
}

#[test]
fn test_read_response_content_length() -> anyhow::Result<()> {
    let (mut stream, server) = serve_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )?;
    let deadline = Deadline::new(Duration::from_secs(5));
    let response = read_response(&mut stream, HttpMethod::Get, &deadline)?;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.body, b"hello");
    let _ = server.join();
    Ok(())
}

#[test]
fn test_read_response_chunked() -> anyhow::Result<()> {
    let (mut stream, server) = serve_once(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n6;ext=1\r\npedia \r\nE\r\nin \r\n\r\nchunks.\r\n0\r\nX-Trailer: 1\r\n\r\n",
    )?;
    let deadline = Deadline::new(Duration::from_secs(5));
    let response = read_response(&mut stream, HttpMethod::Post, &deadline)?;
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body_text(), "Wikipedia in \r\n\r\nchunks.");
    let _ = server.join();
    Ok(())
}

#[test]
fn test_read_response_without_body() -> anyhow::Result<()> {
    // HEAD responses announce a length but carry no body
    let (mut stream, server) =
        serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n")?;
    let deadline = Deadline::new(Duration::from_secs(5));
    let response = read_response(&mut stream, HttpMethod::Head, &deadline)?;
    assert_eq!(response.status_code, 200);
    assert!(response.body.is_empty());
    let _ = server.join();

    let (mut stream, server) = serve_once(b"HTTP/1.1 204 No Content\r\n\r\n")?;
    let response = read_response(&mut stream, HttpMethod::Delete, &deadline)?;
    assert_eq!(response.status_code, 204);
    let _ = server.join();

    // delimited by connection close
    let (mut stream, server) = serve_once(b"HTTP/1.0 404 Not Found\r\n\r\nmissing")?;
    let response = read_response(&mut stream, HttpMethod::Get, &deadline)?;
    assert_eq!(response.status_code, 404);
    assert_eq!(response.body_text(), "missing");
    let _ = server.join();
    Ok(())
}

#[test]
fn test_read_response_errors() -> anyhow::Result<()> {
    let deadline = Deadline::new(Duration::from_secs(5));

    // short body is never a success
    let (mut stream, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")?;
    assert!(matches!(
        read_response(&mut stream, HttpMethod::Get, &deadline),
        Err(Error::TransportError(_))
    ));
    let _ = server.join();

    let (mut stream, server) = serve_once(b"SSH-2.0-OpenSSH\r\n\r\n")?;
    assert!(matches!(
        read_response(&mut stream, HttpMethod::Get, &deadline),
        Err(Error::TransportError(_))
    ));
    let _ = server.join();

    let (mut stream, server) = serve_once(b"")?;
    assert!(matches!(
        read_response(&mut stream, HttpMethod::Get, &deadline),
        Err(Error::TransportError(_))
    ));
    let _ = server.join();
    Ok(())
}

#[test]
fn test_read_response_body_limit() -> anyhow::Result<()> {
    let deadline = Deadline::new(Duration::from_secs(5));

    // an announced length over the limit fails before any body is read
    let (mut stream, server) =
        serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 1073741824\r\n\r\nabc")?;
    match read_response(&mut stream, HttpMethod::Get, &deadline) {
        Err(Error::TransportError(message)) => assert!(message.contains("exceeds"), "{}", message),
        result => anyhow::bail!("expected a transport error, got {:?}", result),
    }
    let _ = server.join();

    // as does a chunk over the limit
    let (mut stream, server) =
        serve_once(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n40000000\r\nabc")?;
    match read_response(&mut stream, HttpMethod::Get, &deadline) {
        Err(Error::TransportError(message)) => assert!(message.contains("exceeds"), "{}", message),
        result => anyhow::bail!("expected a transport error, got {:?}", result),
    }
    let _ = server.join();

    // and a close-delimited body growing past it
    let mut oversized = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
    oversized.resize(oversized.len() + MAX_BODY_SIZE + READ_CHUNK_SIZE, b'x');
    let (mut stream, server) = serve_once(Box::leak(oversized.into_boxed_slice()))?;
    let deadline = Deadline::new(Duration::from_secs(30));
    match read_response(&mut stream, HttpMethod::Get, &deadline) {
        Err(Error::TransportError(message)) => assert!(message.contains("exceeds"), "{}", message),
        result => anyhow::bail!("expected a transport error, got {:?}", result.map(|r| r.status_code)),
    }
    drop(stream);
    let _ = server.join();
    Ok(())
}

#[test]
fn test_read_response_invalid_chunk_size() -> anyhow::Result<()> {
    let deadline = Deadline::new(Duration::from_secs(5));
    let (mut stream, server) =
        serve_once(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nabc\r\n0\r\n\r\n")?;
    assert!(matches!(
        read_response(&mut stream, HttpMethod::Get, &deadline),
        Err(Error::TransportError(_))
    ));
    let _ = server.join();
    Ok(())
}
