// standard
use std::collections::VecDeque;
use std::default::Default;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::option::Option;
use std::string::ToString;
use std::time::Duration;

// extern crates
use regex::Regex;

// upper bound on connecting to the daemon's control port
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("control stream read timeout must not be zero")]
    ReadTimeoutZero(),

    #[error("could not connect to control port")]
    CreationFailed(#[source] std::io::Error),

    #[error("configure control port socket failed")]
    ConfigurationFailed(#[source] std::io::Error),

    #[error("control port parsing regex creation failed")]
    ParsingRegexCreationFailed(#[source] regex::Error),

    #[error("control port stream read failure")]
    ReadFailed(#[source] std::io::Error),

    #[error("control port stream closed by remote")]
    ClosedByRemote(),

    #[error("received control port response invalid utf8")]
    InvalidResponse(#[source] std::str::Utf8Error),

    #[error("failed to parse control port reply: {0}")]
    ReplyParseFailed(String),

    #[error("control port stream write failure")]
    WriteFailed(#[source] std::io::Error),
}

type StatusCode = u32;

#[derive(Debug)]
pub(crate) struct Reply {
    pub status_code: StatusCode,
    pub reply_lines: Vec<String>,
}

// Assembles complete replies out of individual control port lines
// (control-spec.txt section 2.3)
struct ReplyParser {
    pending_reply: Vec<String>,
    reading_multiline_value: bool,
    single_line_data: Regex,
    multi_line_data: Regex,
    end_reply_line: Regex,
}

impl ReplyParser {
    fn new() -> Result<ReplyParser, Error> {
        Ok(ReplyParser {
            pending_reply: Default::default(),
            reading_multiline_value: false,
            single_line_data: Regex::new(r"^[0-9]{3}-.*").map_err(Error::ParsingRegexCreationFailed)?,
            multi_line_data: Regex::new(r"^[0-9]{3}\+.*").map_err(Error::ParsingRegexCreationFailed)?,
            end_reply_line: Regex::new(r"^[0-9]{3} .*").map_err(Error::ParsingRegexCreationFailed)?,
        })
    }

    // feed one line, returns a Reply once its final line has been seen
    fn push_line(&mut self, current_line: String) -> Result<Option<Reply>, Error> {
        // status codes must match within a reply (except for multi-line data)
        if !self.reading_multiline_value {
            if let Some(first_line) = self.pending_reply.first() {
                if current_line.get(0..3) != first_line.get(0..3) {
                    return Err(Error::ReplyParseFailed(format!(
                        "mismatched status codes in '{}' and '{}'",
                        first_line, current_line
                    )));
                }
            }
        }

        if self.reading_multiline_value {
            // the lone '.' terminates multi-line data
            if current_line == "." {
                self.reading_multiline_value = false;
            } else {
                match self.pending_reply.last_mut() {
                    Some(multiline) => {
                        multiline.push('\n');
                        multiline.push_str(&current_line);
                    }
                    // reading_multiline_value implies a pending line
                    None => unreachable!(),
                }
            }
            return Ok(None);
        }

        if self.end_reply_line.is_match(&current_line) {
            self.pending_reply.push(current_line);
            return self.take_reply().map(Some);
        } else if self.single_line_data.is_match(&current_line) {
            self.pending_reply.push(current_line);
        } else if self.multi_line_data.is_match(&current_line) {
            self.pending_reply.push(current_line);
            self.reading_multiline_value = true;
        } else {
            return Err(Error::ReplyParseFailed(format!(
                "unexpected reply line '{}'",
                current_line
            )));
        }
        Ok(None)
    }

    fn take_reply(&mut self) -> Result<Reply, Error> {
        let mut reply_lines = std::mem::take(&mut self.pending_reply);

        // every line has been matched against a three digit prefix
        let status_code_string = match reply_lines.first() {
            Some(line) => line[0..3].to_string(),
            None => unreachable!(),
        };
        let status_code: StatusCode = match status_code_string.parse() {
            Ok(status_code) => status_code,
            Err(_) => {
                return Err(Error::ReplyParseFailed(format!(
                    "unable to parse '{}' as status code",
                    status_code_string
                )))
            }
        };

        // strip the redundant status code and separator from start of lines
        for line in reply_lines.iter_mut() {
            *line = line[4..].to_string();
        }

        Ok(Reply {
            status_code,
            reply_lines,
        })
    }
}

pub(crate) struct LegacyControlStream {
    stream: TcpStream,
    closed_by_remote: bool,
    pending_data: Vec<u8>,
    pending_lines: VecDeque<String>,
    parser: ReplyParser,
}

impl LegacyControlStream {
    pub fn new(addr: &SocketAddr, read_timeout: Duration) -> Result<LegacyControlStream, Error> {
        if read_timeout.is_zero() {
            return Err(Error::ReadTimeoutZero());
        }

        let stream =
            TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).map_err(Error::CreationFailed)?;
        stream
            .set_read_timeout(Some(read_timeout))
            .map_err(Error::ConfigurationFailed)?;

        // pre-allocate a kilobyte for the read buffer
        const READ_BUFFER_SIZE: usize = 1024;

        Ok(LegacyControlStream {
            stream,
            closed_by_remote: false,
            pending_data: Vec::with_capacity(READ_BUFFER_SIZE),
            pending_lines: Default::default(),
            parser: ReplyParser::new()?,
        })
    }

    pub fn closed_by_remote(&self) -> bool {
        self.closed_by_remote
    }

    // returns None if no complete line arrives within the read timeout
    fn read_line(&mut self) -> Result<Option<String>, Error> {
        while self.pending_lines.is_empty() {
            let byte_count = self.pending_data.len();
            match self.stream.read_to_end(&mut self.pending_data) {
                Err(err) => {
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut {
                        if byte_count == self.pending_data.len() {
                            return Ok(None);
                        }
                    } else {
                        return Err(Error::ReadFailed(err));
                    }
                }
                Ok(_count) => {
                    // read_to_end only returns Ok at EOF
                    self.closed_by_remote = true;
                    if byte_count == self.pending_data.len() {
                        return Err(Error::ClosedByRemote());
                    }
                }
            }

            // split our read buffer into individual \r\n terminated lines
            let mut begin = 0;
            while let Some(offset) = self.pending_data[begin..]
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let end = begin + offset;
                let line_string = std::str::from_utf8(&self.pending_data[begin..end])
                    .map_err(Error::InvalidResponse)?;
                self.pending_lines.push_back(line_string.to_string());
                begin = end + 2;
            }
            // leave any leftover bytes in the buffer for the next call
            self.pending_data.drain(0..begin);

            if self.closed_by_remote && self.pending_lines.is_empty() {
                return Err(Error::ClosedByRemote());
            }
        }

        Ok(self.pending_lines.pop_front())
    }

    pub fn read_reply(&mut self) -> Result<Option<Reply>, Error> {
        while let Some(line) = self.read_line()? {
            if let Some(reply) = self.parser.push_line(line)? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    pub fn write(&mut self, cmd: &str) -> Result<(), Error> {
        if let Err(err) = write!(self.stream, "{}\r\n", cmd) {
            self.closed_by_remote = true;
            return Err(Error::WriteFailed(err));
        }
        Ok(())
    }
}

#[cfg(test)]
fn parse_lines(lines: &[&str]) -> Result<Vec<Reply>, Error> {
    let mut parser = ReplyParser::new()?;
    let mut replies: Vec<Reply> = Default::default();
    for line in lines {
        if let Some(reply) = parser.push_line(line.to_string())? {
            replies.push(reply);
        }
    }
    Ok(replies)
}

#[test]
fn test_reply_parser() -> anyhow::Result<()> {
    // single line reply
    let replies = parse_lines(&["250 OK"])?;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status_code, 250);
    assert_eq!(replies[0].reply_lines, vec!["OK".to_string()]);

    // ADD_ONION style reply
    let replies = parse_lines(&[
        "250-ServiceID=6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd",
        "250-PrivateKey=ED25519-V3:abc",
        "250 OK",
    ])?;
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].reply_lines,
        vec![
            "ServiceID=6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd".to_string(),
            "PrivateKey=ED25519-V3:abc".to_string(),
            "OK".to_string(),
        ]
    );

    // multi-line data is squashed into a single entry
    let replies = parse_lines(&[
        "250+config-text=",
        "ControlPort auto",
        "DataDirectory /tmp",
        ".",
        "250 OK",
    ])?;
    assert_eq!(
        replies[0].reply_lines,
        vec![
            "config-text=\nControlPort auto\nDataDirectory /tmp".to_string(),
            "OK".to_string(),
        ]
    );

    // async event followed by a sync reply
    let replies = parse_lines(&[
        "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"",
        "552 Unknown Onion Service id",
    ])?;
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].status_code, 650);
    assert_eq!(replies[1].status_code, 552);

    // errors
    assert!(parse_lines(&["250-a", "251 b"]).is_err());
    assert!(parse_lines(&["garbage"]).is_err());

    Ok(())
}

#[test]
fn test_control_stream() -> anyhow::Result<()> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = std::thread::spawn(move || -> std::io::Result<String> {
        let (mut stream, _) = listener.accept()?;
        let mut command = [0u8; 12];
        stream.read_exact(&mut command)?;
        // reply split across writes
        stream.write_all(b"250-version=0.4.8.")?;
        stream.flush()?;
        std::thread::sleep(Duration::from_millis(50));
        stream.write_all(b"9\r\n250 OK\r\n")?;
        Ok(String::from_utf8_lossy(&command).to_string())
    });

    let mut control_stream = LegacyControlStream::new(&addr, Duration::from_millis(16))?;
    control_stream.write("GETINFO ab")?;

    let mut reply = None;
    while reply.is_none() {
        reply = control_stream.read_reply()?;
    }
    let reply = reply.ok_or_else(|| anyhow::anyhow!("no reply"))?;
    assert_eq!(reply.status_code, 250);
    assert_eq!(reply.reply_lines[0], "version=0.4.8.9");

    assert_eq!(server.join().map_err(|_| anyhow::anyhow!("server panicked"))??, "GETINFO ab\r\n");

    // server side has hung up
    let mut result = control_stream.read_reply();
    while let Ok(None) = result {
        result = control_stream.read_reply();
    }
    assert!(matches!(result, Err(Error::ClosedByRemote())));
    assert!(control_stream.closed_by_remote());

    Ok(())
}
