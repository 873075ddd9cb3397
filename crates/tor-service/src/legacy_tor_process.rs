// standard
use std::default::Default;
use std::fs;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::ops::Drop;
use std::path::Path;
use std::process;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::string::ToString;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// internal crates
use crate::tor_crypto::*;

// how long the daemon gets to write its control port file
const CONTROL_PORT_FILE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_PORT_FILE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONTROL_PORT_PASSWORD_LENGTH: usize = 32usize;
// number of trailing log lines attached to launch failures
const DIAGNOSTIC_LOG_LINES: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read control port file")]
    ControlPortFileReadFailed(#[source] std::io::Error),

    #[error("provided control port file '{0}' larger than expected ({1} bytes)")]
    ControlPortFileTooLarge(String, u64),

    #[error("failed to parse '{0}' as control port file")]
    ControlPortFileContentsInvalid(String),

    #[error("provided tor bin path '{0}' must be an absolute path")]
    TorBinPathNotAbsolute(String),

    #[error("provided data directory '{0}' must be an absolute path")]
    TorDataDirectoryPathNotAbsolute(String),

    #[error("failed to create data directory")]
    DataDirectoryCreationFailed(#[source] std::io::Error),

    #[error("file exists in provided data directory path '{0}'")]
    DataDirectoryPathExistsAsFile(String),

    #[error("failed to write default_torrc file")]
    DefaultTorrcFileWriteFailed(#[source] std::io::Error),

    #[error("failed to create torrc file")]
    TorrcFileCreationFailed(#[source] std::io::Error),

    #[error("failed to remove control_port file")]
    ControlPortFileDeleteFailed(#[source] std::io::Error),

    #[error("failed to start tor process")]
    TorProcessStartFailed(#[source] std::io::Error),

    #[error("tor process exited during startup ({0}): {1}")]
    TorProcessExitedEarly(ExitStatus, String),

    #[error("failed to read control addr from control_file '{0}'")]
    ControlPortFileMissing(String),

    #[error("unable to take tor process stdout")]
    TorProcessStdoutTakeFailed(),

    #[error("failed to spawn tor process stdout read thread")]
    StdoutReadThreadSpawnFailed(#[source] std::io::Error),
}

fn read_control_port_file(control_port_file: &Path) -> Result<SocketAddr, Error> {
    // open file
    let mut file = File::open(control_port_file).map_err(Error::ControlPortFileReadFailed)?;

    // bail if the file is larger than expected
    let metadata = file.metadata().map_err(Error::ControlPortFileReadFailed)?;
    if metadata.len() >= 1024 {
        return Err(Error::ControlPortFileTooLarge(
            format!("{}", control_port_file.display()),
            metadata.len(),
        ));
    }

    // read contents to string
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(Error::ControlPortFileReadFailed)?;

    if let Some(addr_string) = contents.trim_end().strip_prefix("PORT=") {
        if let Ok(addr) = SocketAddr::from_str(addr_string) {
            return Ok(addr);
        }
    }
    Err(Error::ControlPortFileContentsInvalid(format!(
        "{}",
        control_port_file.display()
    )))
}

fn default_torrc_content(socks_port: u16) -> String {
    //  - socks port is either fixed by the caller or picked by the daemon
    //  - minimize writes to disk
    //  - start with network disabled by default
    let socks_port = match socks_port {
        0 => "auto".to_string(),
        port => port.to_string(),
    };
    format!(
        "SocksPort {}\n\
        AvoidDiskWrites 1\n\
        DisableNetwork 1\n\n",
        socks_port
    )
}

// Encapsulates the tor daemon process
pub(crate) struct LegacyTorProcess {
    control_addr: SocketAddr,
    process: Child,
    password: String,
    // stdout data
    stdout_lines: Arc<Mutex<Vec<String>>>,
}

impl LegacyTorProcess {
    pub fn get_control_addr(&self) -> &SocketAddr {
        &self.control_addr
    }

    pub fn get_password(&self) -> &String {
        &self.password
    }

    pub fn new(
        tor_bin_path: &Path,
        data_directory: &Path,
        socks_port: u16,
        launch_timeout: Duration,
    ) -> Result<LegacyTorProcess, Error> {
        if tor_bin_path.is_relative() {
            return Err(Error::TorBinPathNotAbsolute(format!(
                "{}",
                tor_bin_path.display()
            )));
        }
        if data_directory.is_relative() {
            return Err(Error::TorDataDirectoryPathNotAbsolute(format!(
                "{}",
                data_directory.display()
            )));
        }

        // create data directory if it doesn't exist
        if !data_directory.exists() {
            fs::create_dir_all(data_directory).map_err(Error::DataDirectoryCreationFailed)?;
        } else if data_directory.is_file() {
            return Err(Error::DataDirectoryPathExistsAsFile(format!(
                "{}",
                data_directory.display()
            )));
        }

        // construct paths to torrc files
        let default_torrc = data_directory.join("default_torrc");
        let torrc = data_directory.join("torrc");
        let control_port_file = data_directory.join("control_port");

        // the defaults are rewritten on every launch so the socks port follows
        // the requested configuration
        fs::write(&default_torrc, default_torrc_content(socks_port))
            .map_err(Error::DefaultTorrcFileWriteFailed)?;

        // create empty torrc for user
        if !torrc.exists() {
            let _ = File::create(&torrc).map_err(Error::TorrcFileCreationFailed)?;
        }

        // remove any existing control_port_file
        if control_port_file.exists() {
            fs::remove_file(&control_port_file).map_err(Error::ControlPortFileDeleteFailed)?;
        }

        let password = generate_password(CONTROL_PORT_PASSWORD_LENGTH);
        let password_hash = hash_tor_password(&password);

        tracing::debug!(tor_bin_path = %tor_bin_path.display(), data_directory = %data_directory.display(), "launching tor daemon");

        let mut process = Command::new(tor_bin_path.as_os_str())
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            // point to our above written torrc file
            .arg("--defaults-torrc")
            .arg(default_torrc)
            // location of torrc
            .arg("--torrc-file")
            .arg(torrc)
            // root data directory
            .arg("DataDirectory")
            .arg(data_directory)
            // daemon will assign us a port, and we will
            // read it from the control port file
            .arg("ControlPort")
            .arg("auto")
            // control port file destination
            .arg("ControlPortWriteToFile")
            .arg(control_port_file.clone())
            // use password authentication to prevent other apps
            // from modifying our daemon's settings
            .arg("HashedControlPassword")
            .arg(password_hash)
            // tor process will shut down after this process shuts down
            // to avoid orphaned tor daemon
            .arg("__OwningControllerProcess")
            .arg(process::id().to_string())
            .spawn()
            .map_err(Error::TorProcessStartFailed)?;

        let stdout_lines: Arc<Mutex<Vec<String>>> = Default::default();

        {
            let stdout_lines = Arc::downgrade(&stdout_lines);
            let stdout = BufReader::new(match process.stdout.take() {
                Some(stdout) => stdout,
                None => return Err(Error::TorProcessStdoutTakeFailed()),
            });

            std::thread::Builder::new()
                .name("tor_stdout_reader".to_string())
                .spawn(move || {
                    LegacyTorProcess::read_stdout_task(&stdout_lines, stdout);
                })
                .map_err(Error::StdoutReadThreadSpawnFailed)?;
        }

        let mut tor_process = LegacyTorProcess {
            // replaced once the control port file is read
            control_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            process,
            password,
            stdout_lines,
        };

        // try and read the control port from the control port file
        // or abort after CONTROL_PORT_FILE_TIMEOUT (or the caller's limit if shorter)
        let control_port_file_timeout = CONTROL_PORT_FILE_TIMEOUT.min(launch_timeout);
        let start = Instant::now();
        loop {
            if control_port_file.exists() {
                tor_process.control_addr = read_control_port_file(control_port_file.as_path())?;
                fs::remove_file(&control_port_file).map_err(Error::ControlPortFileDeleteFailed)?;
                break;
            }
            if let Some(status) = tor_process.exit_status() {
                return Err(Error::TorProcessExitedEarly(
                    status,
                    tor_process.recent_log_lines(),
                ));
            }
            if start.elapsed() >= control_port_file_timeout {
                return Err(Error::ControlPortFileMissing(format!(
                    "{}",
                    control_port_file.display()
                )));
            }
            std::thread::sleep(CONTROL_PORT_FILE_POLL_INTERVAL);
        }

        Ok(tor_process)
    }

    fn read_stdout_task(
        stdout_lines: &std::sync::Weak<Mutex<Vec<String>>>,
        mut stdout: BufReader<ChildStdout>,
    ) {
        while let Some(stdout_lines) = stdout_lines.upgrade() {
            let mut line = String::default();
            // read line; EOF or error means the daemon is gone
            match stdout.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    // remove trailing '\n'
                    line.pop();
                    // then acquire the lock on the line buffer
                    let mut stdout_lines = match stdout_lines.lock() {
                        Ok(stdout_lines) => stdout_lines,
                        Err(_) => unreachable!(),
                    };
                    stdout_lines.push(line);
                }
            }
        }
    }

    pub fn wait_log_lines(&mut self) -> Vec<String> {
        let mut lines = match self.stdout_lines.lock() {
            Ok(lines) => lines,
            Err(_) => unreachable!(),
        };
        std::mem::take(&mut lines)
    }

    // the last few buffered log lines joined for use in error messages
    fn recent_log_lines(&mut self) -> String {
        let lines = self.wait_log_lines();
        let skip = lines.len().saturating_sub(DIAGNOSTIC_LOG_LINES);
        lines[skip..].join(" | ")
    }

    /// Exit status of the daemon, if it has exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.process.try_wait() {
            Ok(status) => status,
            Err(_) => None,
        }
    }

    /// Wait up to `timeout` for the daemon to exit on its own, then kill it
    pub fn wait_or_kill(&mut self, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.exit_status().is_some() {
                return;
            }
            std::thread::sleep(CONTROL_PORT_FILE_POLL_INTERVAL);
        }
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

impl Drop for LegacyTorProcess {
    fn drop(&mut self) {
        if self.exit_status().is_none() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}

#[test]
fn test_default_torrc_content() {
    assert_eq!(
        default_torrc_content(0),
        "SocksPort auto\nAvoidDiskWrites 1\nDisableNetwork 1\n\n"
    );
    assert!(default_torrc_content(9150).starts_with("SocksPort 9150\n"));
}

#[test]
fn test_read_control_port_file() -> anyhow::Result<()> {
    let data_path = std::env::temp_dir().join("test_read_control_port_file");
    fs::create_dir_all(&data_path)?;
    let control_port_file = data_path.join("control_port");

    fs::write(&control_port_file, "PORT=127.0.0.1:9051\n")?;
    assert_eq!(
        read_control_port_file(&control_port_file)?,
        SocketAddr::from(([127, 0, 0, 1], 9051))
    );

    fs::write(&control_port_file, "PORT=localhost\n")?;
    assert!(matches!(
        read_control_port_file(&control_port_file),
        Err(Error::ControlPortFileContentsInvalid(_))
    ));

    fs::write(&control_port_file, "9051\n")?;
    assert!(read_control_port_file(&control_port_file).is_err());

    fs::remove_file(&control_port_file)?;
    assert!(matches!(
        read_control_port_file(&control_port_file),
        Err(Error::ControlPortFileReadFailed(_))
    ));

    Ok(())
}

#[test]
fn test_relative_paths_rejected() {
    let data_path = std::env::temp_dir().join("test_relative_paths_rejected");
    assert!(matches!(
        LegacyTorProcess::new(Path::new("tor"), &data_path, 0, CONTROL_PORT_FILE_TIMEOUT),
        Err(Error::TorBinPathNotAbsolute(_))
    ));
    assert!(matches!(
        LegacyTorProcess::new(Path::new("/usr/bin/tor"), Path::new("data"), 0, CONTROL_PORT_FILE_TIMEOUT),
        Err(Error::TorDataDirectoryPathNotAbsolute(_))
    ));
}
