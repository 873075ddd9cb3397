// standard
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

// extern crates
use regex::Regex;

// internal crates
use tor_service::config::ServiceConfig;
use tor_service::http_client::{HttpMethod, HttpRequest};
use tor_service::mock_tor_engine::MockTorEngineFactory;
use tor_service::{Error, ServiceStatus, TorSupervisor};

// Serves each connection with a response whose body describes the request:
// "<request line>\n<x-test header>\n<body>"
fn start_echo_server() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    std::thread::spawn(move || {
                        let _ = echo(stream);
                    });
                }
                Err(_) => break,
            }
        }
    });
    Ok(port)
}

fn echo(mut stream: TcpStream) -> std::io::Result<()> {
    let mut request: Vec<u8> = Default::default();
    let mut buffer = [0u8; 1024];
    let head_end = loop {
        if let Some(end) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            break end;
        }
        let count = stream.read(&mut buffer)?;
        if count == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buffer[..count]);
    };

    let head = String::from_utf8_lossy(&request[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("").to_string();
    let mut content_length = 0usize;
    let mut x_test = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "x-test" => x_test = value.trim().to_string(),
                _ => (),
            }
        }
    }

    let mut body = request[head_end + 4..].to_vec();
    while body.len() < content_length {
        let count = stream.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..count]);
    }

    let response_body = format!(
        "{}\n{}\n{}",
        request_line,
        x_test,
        String::from_utf8_lossy(&body)
    );
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        response_body.len(),
        response_body
    )?;
    stream.flush()
}

fn running_supervisor(name: &str) -> anyhow::Result<TorSupervisor> {
    let supervisor = TorSupervisor::new(MockTorEngineFactory::new());
    let data_dir = std::env::temp_dir().join("tor_service_tests").join(name);
    supervisor.init_or_start(ServiceConfig::new(data_dir, 0))?;
    Ok(supervisor)
}

#[test]
fn test_http_through_onion_service() -> anyhow::Result<()> {
    let port = start_echo_server()?;
    let supervisor = running_supervisor("test_http_through_onion_service")?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);

    let info = supervisor.create_hidden_service(80, port, None)?;
    let onion_address = Regex::new(r"^[a-z2-7]{56}\.onion$")?;
    assert!(onion_address.is_match(&info.onion_address));

    let url = format!("http://{}/hello?name=tor", info.onion_address);
    let response = supervisor.http_request(
        &HttpRequest::new(HttpMethod::Get, url.as_str())
            .with_headers_json(r#"{"X-Test": "get"}"#)?
            .with_body("ignored"),
    )?;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.body_text(), "GET /hello?name=tor HTTP/1.1\nget\n");

    for (method, name) in [(HttpMethod::Post, "POST"), (HttpMethod::Put, "PUT")] {
        let response = supervisor.http_request(
            &HttpRequest::new(method, url.as_str())
                .with_headers_json(r#"{"X-Test": "upload"}"#)?
                .with_body("{\"key\":\"value\"}"),
        )?;
        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.body_text(),
            format!("{} /hello?name=tor HTTP/1.1\nupload\n{{\"key\":\"value\"}}", name)
        );
    }

    for (method, name) in [(HttpMethod::Delete, "DELETE"), (HttpMethod::Options, "OPTIONS")] {
        let response = supervisor.http_request(&HttpRequest::new(method, url.as_str()))?;
        assert_eq!(response.status_code, 200);
        assert!(response.body_text().starts_with(name));
    }

    let response = supervisor.http_request(&HttpRequest::new(HttpMethod::Head, url.as_str()))?;
    assert_eq!(response.status_code, 200);
    assert!(response.body.is_empty());

    supervisor.shutdown()?;
    supervisor.shutdown()?;
    assert_eq!(supervisor.status(), ServiceStatus::Stopped);
    Ok(())
}

#[test]
fn test_http_requires_running_service() -> anyhow::Result<()> {
    let supervisor = TorSupervisor::new(MockTorEngineFactory::new());
    let request = HttpRequest::new(HttpMethod::Get, "http://example.com/");
    assert!(matches!(
        supervisor.http_request(&request),
        Err(Error::ProxyUnavailable(ServiceStatus::NotStarted))
    ));

    let supervisor = running_supervisor("test_http_requires_running_service")?;
    supervisor.shutdown()?;
    assert!(matches!(
        supervisor.http_request(&request),
        Err(Error::ProxyUnavailable(ServiceStatus::Stopped))
    ));
    Ok(())
}

#[test]
fn test_http_request_timeout() -> anyhow::Result<()> {
    // accepts connections but never answers
    let silent = TcpListener::bind("127.0.0.1:0")?;
    let port = silent.local_addr()?.port();

    let supervisor = running_supervisor("test_http_request_timeout")?;
    let info = supervisor.create_hidden_service(80, port, None)?;
    let url = format!("http://{}/", info.onion_address);

    for timeout in [Duration::from_millis(1), Duration::from_millis(250)] {
        let start = Instant::now();
        let result = supervisor
            .http_request(&HttpRequest::new(HttpMethod::Get, url.as_str()).with_timeout(timeout));
        assert!(
            matches!(result, Err(Error::RequestTimeout(ms)) if ms == timeout.as_millis()),
            "{:?}",
            result
        );
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }
    drop(silent);
    Ok(())
}

#[test]
fn test_http_unreachable_targets() -> anyhow::Result<()> {
    let supervisor = running_supervisor("test_http_unreachable_targets")?;

    // onion service nobody registered
    let unknown = supervisor.create_hidden_service(80, 9, None)?;
    supervisor.delete_hidden_service(&unknown.onion_address)?;
    match supervisor.http_request(&HttpRequest::new(
        HttpMethod::Get,
        format!("http://{}/", unknown.onion_address),
    )) {
        Err(Error::TransportError(message)) => {
            assert!(message.contains("descriptor can not be found"), "{}", message)
        }
        result => anyhow::bail!("expected a transport error, got {:?}", result),
    }

    // https is not supported
    assert!(matches!(
        supervisor.http_request(&HttpRequest::new(HttpMethod::Get, "https://example.com/")),
        Err(Error::InvalidArgument(_))
    ));

    // malformed headers are rejected before any request is made
    assert!(matches!(
        HttpRequest::new(HttpMethod::Get, "http://example.com/").with_headers_json("[1, 2]"),
        Err(Error::MalformedHeaders(_))
    ));
    Ok(())
}
