// standard
use std::default::Default;
use std::net::SocketAddr;
use std::option::Option;
use std::str::FromStr;
use std::string::ToString;
use std::time::{Duration, Instant};

// extern crates
use regex::Regex;

// internal crates
use crate::legacy_tor_control_stream::*;
use crate::tor_crypto::*;

// upper bound on waiting for the reply to a single command
const SYNC_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("response regex creation failed")]
    ParsingRegexCreationFailed(#[source] regex::Error),

    #[error("control stream read reply failed")]
    ReadReplyFailed(#[source] crate::legacy_tor_control_stream::Error),

    #[error("unexpected synchronous reply recieved")]
    UnexpectedSynchonousReplyReceived(),

    #[error("no reply received within {0:?}")]
    SyncReplyTimedOut(Duration),

    #[error("control stream write command failed")]
    WriteCommandFailed(#[source] crate::legacy_tor_control_stream::Error),

    #[error("invalid command arguments: {0}")]
    InvalidCommandArguments(String),

    #[error("command failed: {0} {}", .1.join("\n"))]
    CommandFailed(u32, Vec<String>),

    #[error("failed to parse command reply: {0}")]
    CommandReplyParseFailed(String),
}

// Per-command data
#[derive(Default)]
pub(crate) struct AddOnionFlags {
    pub discard_pk: bool,
    pub detach: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AsyncEvent {
    Unknown {
        lines: Vec<String>,
    },
    StatusClient {
        severity: String,
        action: String,
        arguments: Vec<(String, String)>,
    },
    HsDesc {
        action: String,
        hs_address: V3OnionServiceId,
    },
}

pub(crate) struct LegacyTorController {
    // underlying control stream
    control_stream: LegacyControlStream,
    // list of async replies to be handled
    async_replies: Vec<Reply>,
    // regex for parsing events
    status_event_pattern: Regex,
    status_event_argument_pattern: Regex,
    hs_desc_pattern: Regex,
}

impl LegacyTorController {
    pub fn new(control_stream: LegacyControlStream) -> Result<LegacyTorController, Error> {
        let status_event_pattern =
            Regex::new(r#"^STATUS_CLIENT (?P<severity>NOTICE|WARN|ERR) (?P<action>[A-Za-z_]+)"#)
                .map_err(Error::ParsingRegexCreationFailed)?;
        let status_event_argument_pattern =
            Regex::new(r#"(?P<key>[A-Z_]+)=(?P<value>[A-Za-z0-9_]+|"[^"]+")"#)
                .map_err(Error::ParsingRegexCreationFailed)?;
        let hs_desc_pattern = Regex::new(
            r#"HS_DESC (?P<action>REQUESTED|UPLOAD|RECEIVED|UPLOADED|IGNORE|FAILED|CREATED) (?P<hsaddress>[a-z2-7]{56})"#
        ).map_err(Error::ParsingRegexCreationFailed)?;

        Ok(LegacyTorController {
            control_stream,
            async_replies: Default::default(),
            // regex
            status_event_pattern,
            status_event_argument_pattern,
            hs_desc_pattern,
        })
    }

    pub fn closed_by_remote(&self) -> bool {
        self.control_stream.closed_by_remote()
    }

    // return curently available events, does not block waiting
    // for an event
    fn wait_async_replies(&mut self) -> Result<Vec<Reply>, Error> {
        // take any previously received async replies
        let mut replies = std::mem::take(&mut self.async_replies);

        // and keep consuming until none are available
        while let Some(reply) = self
            .control_stream
            .read_reply()
            .map_err(Error::ReadReplyFailed)?
        {
            replies.push(reply);
        }
        Ok(replies)
    }

    fn reply_to_event(&self, reply: &mut Reply) -> Result<AsyncEvent, Error> {
        if reply.status_code != 650u32 {
            return Err(Error::UnexpectedSynchonousReplyReceived());
        }

        let reply_text = reply.reply_lines.join(" ");
        if let Some(caps) = self.status_event_pattern.captures(&reply_text) {
            let severity = match caps.name("severity") {
                Some(severity) => severity.as_str(),
                None => unreachable!(),
            };
            let action = match caps.name("action") {
                Some(action) => action.as_str(),
                None => unreachable!(),
            };

            let mut arguments: Vec<(String, String)> = Default::default();
            for caps in self
                .status_event_argument_pattern
                .captures_iter(&reply_text)
            {
                let key = match caps.name("key") {
                    Some(key) => key.as_str(),
                    None => unreachable!(),
                };
                let value = match caps.name("value") {
                    Some(value) => value.as_str(),
                    None => unreachable!(),
                };
                let value = value
                    .strip_prefix('\"')
                    .and_then(|value| value.strip_suffix('\"'))
                    .unwrap_or(value);
                arguments.push((key.to_string(), value.to_string()));
            }

            return Ok(AsyncEvent::StatusClient {
                severity: severity.to_string(),
                action: action.to_string(),
                arguments,
            });
        }

        if let Some(caps) = self.hs_desc_pattern.captures(&reply_text) {
            let action = match caps.name("action") {
                Some(action) => action.as_str(),
                None => unreachable!(),
            };
            let hs_address = match caps.name("hsaddress") {
                Some(hs_address) => hs_address.as_str(),
                None => unreachable!(),
            };

            if let Ok(hs_address) = V3OnionServiceId::from_string(hs_address) {
                return Ok(AsyncEvent::HsDesc {
                    action: action.to_string(),
                    hs_address,
                });
            }
        }

        // no luck parsing reply, just return full text
        Ok(AsyncEvent::Unknown {
            lines: std::mem::take(&mut reply.reply_lines),
        })
    }

    pub fn wait_async_events(&mut self) -> Result<Vec<AsyncEvent>, Error> {
        let mut async_replies = self.wait_async_replies()?;
        let mut async_events: Vec<AsyncEvent> = Vec::with_capacity(async_replies.len());

        for reply in async_replies.iter_mut() {
            async_events.push(self.reply_to_event(reply)?);
        }

        Ok(async_events)
    }

    // wait for a sync reply, save off async replies for later
    fn wait_sync_reply(&mut self) -> Result<Reply, Error> {
        let start = Instant::now();
        loop {
            if let Some(reply) = self
                .control_stream
                .read_reply()
                .map_err(Error::ReadReplyFailed)?
            {
                match reply.status_code {
                    650u32 => self.async_replies.push(reply),
                    _ => return Ok(reply),
                }
            } else if start.elapsed() >= SYNC_REPLY_TIMEOUT {
                return Err(Error::SyncReplyTimedOut(SYNC_REPLY_TIMEOUT));
            }
        }
    }

    fn write_command(&mut self, text: &str) -> Result<Reply, Error> {
        self.control_stream
            .write(text)
            .map_err(Error::WriteCommandFailed)?;
        self.wait_sync_reply()
    }

    //
    // Tor Commands
    //
    // The section where we can find the specification in control-spec.txt
    // for the underlying command is listed in parentheses
    //
    // Each of these command wrapper methods block until completion
    //

    // SETCONF (3.1)
    fn setconf_cmd(&mut self, key_values: &[(&str, String)]) -> Result<Reply, Error> {
        if key_values.is_empty() {
            return Err(Error::InvalidCommandArguments(
                "SETCONF key-value pairs list must not be empty".to_string(),
            ));
        }
        let mut command_buffer = vec!["SETCONF".to_string()];

        for (key, value) in key_values.iter() {
            command_buffer.push(format!("{}=\"{}\"", key, value.trim()));
        }
        let command = command_buffer.join(" ");

        self.write_command(&command)
    }

    // SETEVENTS (3.4)
    fn setevents_cmd(&mut self, event_codes: &[&str]) -> Result<Reply, Error> {
        if event_codes.is_empty() {
            return Err(Error::InvalidCommandArguments(
                "SETEVENTS event codes list mut not be empty".to_string(),
            ));
        }
        let command = format!("SETEVENTS {}", event_codes.join(" "));

        self.write_command(&command)
    }

    // AUTHENTICATE (3.5)
    fn authenticate_cmd(&mut self, password: &str) -> Result<Reply, Error> {
        let command = format!("AUTHENTICATE \"{}\"", password);

        self.write_command(&command)
    }

    // SIGNAL (3.7)
    fn signal_cmd(&mut self, signal: &str) -> Result<Reply, Error> {
        let command = format!("SIGNAL {}", signal);

        self.write_command(&command)
    }

    // GETINFO (3.9)
    fn getinfo_cmd(&mut self, keywords: &[&str]) -> Result<Reply, Error> {
        if keywords.is_empty() {
            return Err(Error::InvalidCommandArguments(
                "GETINFO keywords list must not be empty".to_string(),
            ));
        }
        let command = format!("GETINFO {}", keywords.join(" "));

        self.write_command(&command)
    }

    // ADD_ONION (3.27)
    fn add_onion_cmd(
        &mut self,
        key: Option<&Ed25519PrivateKey>,
        flags: &AddOnionFlags,
        virt_port: u16,
        target: Option<SocketAddr>,
    ) -> Result<Reply, Error> {
        let mut command_buffer = vec!["ADD_ONION".to_string()];

        // set our key or request a new one
        if let Some(key) = key {
            command_buffer.push(key.to_key_blob());
        } else {
            command_buffer.push("NEW:ED25519-V3".to_string());
        }

        // set our flags
        let mut flag_buffer: Vec<&str> = Default::default();
        if flags.discard_pk {
            flag_buffer.push("DiscardPK");
        }
        if flags.detach {
            flag_buffer.push("Detach");
        }
        if !flag_buffer.is_empty() {
            command_buffer.push(format!("Flags={}", flag_buffer.join(",")));
        }

        // set our onion service target
        if let Some(target) = target {
            command_buffer.push(format!("Port={},{}", virt_port, target));
        } else {
            command_buffer.push(format!("Port={}", virt_port));
        }

        // finally send the command
        let command = command_buffer.join(" ");

        self.write_command(&command)
    }

    // DEL_ONION (3.38)
    fn del_onion_cmd(&mut self, service_id: &V3OnionServiceId) -> Result<Reply, Error> {
        let command = format!("DEL_ONION {}", service_id);

        self.write_command(&command)
    }

    //
    // Public high-level typesafe command method wrappers
    //

    pub fn setconf(&mut self, key_values: &[(&str, String)]) -> Result<(), Error> {
        let reply = self.setconf_cmd(key_values)?;

        match reply.status_code {
            250u32 => Ok(()),
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    pub fn setevents(&mut self, events: &[&str]) -> Result<(), Error> {
        let reply = self.setevents_cmd(events)?;

        match reply.status_code {
            250u32 => Ok(()),
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    pub fn authenticate(&mut self, password: &str) -> Result<(), Error> {
        let reply = self.authenticate_cmd(password)?;

        match reply.status_code {
            250u32 => Ok(()),
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    pub fn signal(&mut self, signal: &str) -> Result<(), Error> {
        let reply = self.signal_cmd(signal)?;

        match reply.status_code {
            250u32 => Ok(()),
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    pub fn getinfo(&mut self, keywords: &[&str]) -> Result<Vec<(String, String)>, Error> {
        let reply = self.getinfo_cmd(keywords)?;

        match reply.status_code {
            250u32 => {
                let mut key_values: Vec<(String, String)> = Default::default();
                for line in reply.reply_lines {
                    match line.split_once('=') {
                        Some((key, value)) => key_values.push((key.to_string(), value.to_string())),
                        None => {
                            if line != "OK" {
                                key_values.push((line, String::new()))
                            }
                        }
                    }
                }
                Ok(key_values)
            }
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    pub fn add_onion(
        &mut self,
        key: Option<&Ed25519PrivateKey>,
        flags: &AddOnionFlags,
        virt_port: u16,
        target: Option<SocketAddr>,
    ) -> Result<(Option<Ed25519PrivateKey>, V3OnionServiceId), Error> {
        let reply = self.add_onion_cmd(key, flags, virt_port, target)?;

        let mut private_key: Option<Ed25519PrivateKey> = None;
        let mut service_id: Option<V3OnionServiceId> = None;

        match reply.status_code {
            250u32 => {
                for line in reply.reply_lines {
                    if let Some(service_id_string) = line.strip_prefix("ServiceID=") {
                        if service_id.is_some() {
                            return Err(Error::CommandReplyParseFailed(
                                "received duplicate ServiceID entries".to_string(),
                            ));
                        }
                        service_id = match V3OnionServiceId::from_string(service_id_string) {
                            Ok(service_id) => Some(service_id),
                            Err(_) => {
                                return Err(Error::CommandReplyParseFailed(format!(
                                    "could not parse '{}' as V3OnionServiceId",
                                    service_id_string
                                )))
                            }
                        }
                    } else if let Some(key_blob_string) = line.strip_prefix("PrivateKey=") {
                        if private_key.is_some() {
                            return Err(Error::CommandReplyParseFailed(
                                "received duplicate PrivateKey entries".to_string(),
                            ));
                        }
                        private_key = match Ed25519PrivateKey::from_key_blob(key_blob_string) {
                            Ok(private_key) => Some(private_key),
                            Err(_) => {
                                return Err(Error::CommandReplyParseFailed(format!(
                                    "could not parse {} as Ed25519PrivateKey",
                                    key_blob_string
                                )))
                            }
                        };
                    } else if line != "OK" {
                        return Err(Error::CommandReplyParseFailed(format!(
                            "received unexpected reply line '{}'",
                            line
                        )));
                    }
                }
            }
            code => return Err(Error::CommandFailed(code, reply.reply_lines)),
        }

        // tor only returns the private key when it generated it
        if flags.discard_pk && private_key.is_some() {
            return Err(Error::CommandReplyParseFailed(
                "PrivateKey response should have been discard".to_string(),
            ));
        }

        match service_id {
            Some(service_id) => Ok((private_key, service_id)),
            None => Err(Error::CommandReplyParseFailed(
                "did not receive a ServiceID".to_string(),
            )),
        }
    }

    pub fn del_onion(&mut self, service_id: &V3OnionServiceId) -> Result<(), Error> {
        let reply = self.del_onion_cmd(service_id)?;

        match reply.status_code {
            250u32 => Ok(()),
            code => Err(Error::CommandFailed(code, reply.reply_lines)),
        }
    }

    // more specific encapulsation of specific command invocations

    pub fn getinfo_net_listeners_socks(&mut self) -> Result<Vec<SocketAddr>, Error> {
        let response = self.getinfo(&["net/listeners/socks"])?;
        for (key, value) in response.iter() {
            if key.as_str() == "net/listeners/socks" {
                return parse_socks_listeners(value);
            }
        }
        Err(Error::CommandReplyParseFailed(
            "reply did not find a 'net/listeners/socks' key/value".to_string(),
        ))
    }

    pub fn getinfo_version(&mut self) -> Result<String, Error> {
        let response = self.getinfo(&["version"])?;
        for (key, value) in response.into_iter() {
            if key.as_str() == "version" {
                return Ok(value);
            }
        }
        Err(Error::CommandReplyParseFailed(
            "did not find a 'version' key/value".to_string(),
        ))
    }
}

// parse a space separated list of double-quoted socket addresses
fn parse_socks_listeners(value: &str) -> Result<Vec<SocketAddr>, Error> {
    let mut result: Vec<SocketAddr> = Default::default();
    for socket_addr in value.split(' ').filter(|entry| !entry.is_empty()) {
        let parsed = socket_addr
            .strip_prefix('\"')
            .and_then(|stripped| stripped.strip_suffix('\"'))
            .and_then(|stripped| SocketAddr::from_str(stripped).ok());
        match parsed {
            Some(parsed) => result.push(parsed),
            // unix socket listeners and the like are of no use to us
            None if socket_addr.starts_with("\"unix:") => continue,
            None => {
                return Err(Error::CommandReplyParseFailed(format!(
                    "could not parse '{}' as socket address",
                    socket_addr
                )))
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
use std::io::{BufRead, BufReader, Write};
#[cfg(test)]
use std::net::TcpListener;

// A scripted control port: answers each expected command with a canned reply
#[cfg(test)]
fn scripted_control_port(
    script: Vec<(&'static str, &'static str)>,
) -> anyhow::Result<(SocketAddr, std::thread::JoinHandle<anyhow::Result<()>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || -> anyhow::Result<()> {
        let (stream, _) = listener.accept()?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        for (expected, reply) in script {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            anyhow::ensure!(
                line.trim_end().starts_with(expected),
                "unexpected command '{}', expected '{}'",
                line.trim_end(),
                expected
            );
            writer.write_all(reply.as_bytes())?;
        }
        Ok(())
    });
    Ok((addr, handle))
}

#[test]
fn test_tor_controller_commands() -> anyhow::Result<()> {
    let service_id = "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd";
    let (addr, server) = scripted_control_port(vec![
        ("AUTHENTICATE \"password\"", "250 OK\r\n"),
        ("AUTHENTICATE \"invalid\"", "515 Authentication failed: Password did not match\r\n"),
        ("SETEVENTS STATUS_CLIENT HS_DESC", "250 OK\r\n"),
        ("GETINFO version", "250-version=0.4.8.9\r\n250 OK\r\n"),
        (
            "GETINFO net/listeners/socks",
            "250-net/listeners/socks=\"127.0.0.1:9150\" \"unix:/tmp/socks\"\r\n250 OK\r\n",
        ),
        (
            "ADD_ONION NEW:ED25519-V3 Port=80,127.0.0.1:8080",
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n\
             250-ServiceID=6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd\r\n\
             250-PrivateKey=ED25519-V3:YE3GZtDmc+izGijWKgeVRabbXqK456JKKGONDBhV+kPBVKa2mHVQqnRTVuFXe3inU3YW6qvc7glYEwe9rK0LhQ==\r\n\
             250 OK\r\n",
        ),
        ("DEL_ONION 6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd", "250 OK\r\n"),
        ("DEL_ONION 6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd", "552 Unknown Onion Service id\r\n"),
        ("SETCONF DisableNetwork=\"0\"", "250 OK\r\n"),
        ("SIGNAL HALT", "250 OK\r\n"),
    ])?;

    let control_stream = LegacyControlStream::new(&addr, Duration::from_millis(16))?;
    let mut tor_controller = LegacyTorController::new(control_stream)?;

    tor_controller.authenticate("password")?;
    assert!(matches!(
        tor_controller.authenticate("invalid"),
        Err(Error::CommandFailed(515, _))
    ));
    tor_controller.setevents(&["STATUS_CLIENT", "HS_DESC"])?;
    assert_eq!(tor_controller.getinfo_version()?, "0.4.8.9");
    assert_eq!(
        tor_controller.getinfo_net_listeners_socks()?,
        vec![SocketAddr::from(([127, 0, 0, 1], 9150))]
    );

    let (private_key, returned_service_id) = tor_controller.add_onion(
        None,
        &Default::default(),
        80,
        Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
    )?;
    assert_eq!(returned_service_id.as_str(), service_id);
    let private_key = private_key.ok_or_else(|| anyhow::anyhow!("missing private key"))?;
    assert_eq!(
        V3OnionServiceId::from_private_key(&private_key),
        returned_service_id
    );

    // the async event received while waiting for ADD_ONION is kept
    let events = tor_controller.wait_async_events()?;
    assert_eq!(
        events,
        vec![AsyncEvent::StatusClient {
            severity: "NOTICE".to_string(),
            action: "BOOTSTRAP".to_string(),
            arguments: vec![
                ("PROGRESS".to_string(), "100".to_string()),
                ("TAG".to_string(), "done".to_string()),
                ("SUMMARY".to_string(), "Done".to_string()),
            ],
        }]
    );

    tor_controller.del_onion(&returned_service_id)?;
    assert!(
        tor_controller.del_onion(&returned_service_id).is_err(),
        "deleting unknown onion should have failed"
    );
    tor_controller.setconf(&[("DisableNetwork", "0".to_string())])?;
    tor_controller.signal("HALT")?;

    server
        .join()
        .map_err(|_| anyhow::anyhow!("control port thread panicked"))??;

    Ok(())
}

#[test]
fn test_hs_desc_event() -> anyhow::Result<()> {
    let (addr, server) = scripted_control_port(vec![(
        "GETINFO version",
        "650 HS_DESC UPLOADED 6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd UNKNOWN $ABCD\r\n\
         650 CIRC 1 BUILT\r\n\
         250-version=0.4.8.9\r\n250 OK\r\n",
    )])?;

    let control_stream = LegacyControlStream::new(&addr, Duration::from_millis(16))?;
    let mut tor_controller = LegacyTorController::new(control_stream)?;
    tor_controller.getinfo_version()?;

    let events = tor_controller.wait_async_events()?;
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        AsyncEvent::HsDesc {
            action: "UPLOADED".to_string(),
            hs_address: V3OnionServiceId::from_string(
                "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd"
            )?,
        }
    );
    assert!(matches!(events[1], AsyncEvent::Unknown { .. }));

    server
        .join()
        .map_err(|_| anyhow::anyhow!("control port thread panicked"))??;

    Ok(())
}

#[test]
fn test_parse_socks_listeners() -> anyhow::Result<()> {
    assert!(parse_socks_listeners("")?.is_empty());
    assert_eq!(
        parse_socks_listeners("\"127.0.0.1:9050\" \"[::1]:9050\"")?,
        vec![
            SocketAddr::from(([127, 0, 0, 1], 9050)),
            "[::1]:9050".parse::<SocketAddr>()?
        ]
    );
    assert!(parse_socks_listeners("127.0.0.1:9050").is_err());
    Ok(())
}
