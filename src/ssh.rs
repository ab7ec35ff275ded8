use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::session::{Connector, Credential, ShellTransport, SshTarget};

const CLOSE_GRACE: Duration = Duration::from_secs(5);
const READ_BUFFER_SIZE: usize = 4096;

/// Environment variable carrying the router password to the askpass helper.
pub const ASKPASS_ENV: &str = "ARP_PRESENCE_ASKPASS";

/// Connects by spawning the system `ssh` client with a forced remote terminal.
///
/// OpenSSH reads passwords from the controlling terminal, not stdin. Password
/// logins point `SSH_ASKPASS` at a helper (this binary by default) and pass the
/// password in [`ASKPASS_ENV`] on the child's environment only.
#[derive(Debug, Clone)]
pub struct SshConnector {
    program: PathBuf,
    askpass: Option<PathBuf>,
}

impl Default for SshConnector {
    fn default() -> Self {
        SshConnector {
            program: PathBuf::from("ssh"),
            askpass: std::env::current_exe().ok(),
        }
    }
}

impl SshConnector {
    fn command(&self, target: &SshTarget) -> io::Result<Command> {
        let mut command = Command::new(&self.program);
        command.arg("-tt");
        if let Some(port) = target.port {
            command.arg("-p").arg(port.to_string());
        }
        match &target.credential {
            Credential::KeyFile(path) => {
                command.arg("-i").arg(path);
            }
            Credential::Password(password) => {
                let askpass = self.askpass.as_ref().ok_or_else(|| {
                    io::Error::other("no askpass helper available for password login")
                })?;
                command
                    .args(["-o", "NumberOfPasswordPrompts=1"])
                    .env("SSH_ASKPASS", askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(ASKPASS_ENV, password);
            }
        }
        if target.accept_new_host_keys {
            command.args(["-o", "StrictHostKeyChecking=accept-new"]);
        }
        command.arg(format!("{}@{}", target.username, target.host));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

/// Answer for an `SSH_ASKPASS` invocation. Only password prompts get the
/// password; anything else (such as a host key question) is declined.
pub fn askpass_reply<'a>(prompt: &str, password: &'a str) -> Option<&'a str> {
    prompt
        .to_lowercase()
        .contains("password")
        .then_some(password)
}

impl Connector for SshConnector {
    type Transport = SshProcess;

    async fn connect(&self, target: &SshTarget) -> io::Result<SshProcess> {
        let mut child = self.command(target)?.spawn()?;
        debug!("Spawned ssh to {} (pid {:?})", target.host, child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ssh stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ssh stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("ssh stderr not captured"))?;

        // ssh reports connection failures on stderr and the shell on stdout;
        // both feed one stream so the handshake sees them in arrival order.
        let (tx, output) = mpsc::channel(32);
        tokio::spawn(forward(stdout, tx.clone()));
        tokio::spawn(forward(stderr, tx));

        Ok(SshProcess {
            child,
            stdin,
            output,
            pending: Vec::new(),
        })
    }
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
}

pub struct SshProcess {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::Receiver<io::Result<Vec<u8>>>,
    /// Trailing bytes of a UTF-8 sequence split across reads.
    pending: Vec<u8>,
}

/// Appends `bytes` to `pending` and returns the longest complete UTF-8
/// prefix, leaving a split trailing sequence behind for the next read.
fn decode_utf8(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(complete);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

impl ShellTransport for SshProcess {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    async fn recv(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.output.recv().await {
                Some(Ok(bytes)) => {
                    let text = decode_utf8(&mut self.pending, &bytes);
                    if !text.is_empty() {
                        return Ok(Some(text));
                    }
                }
                Some(Err(err)) => return Err(err),
                None if self.pending.is_empty() => return Ok(None),
                None => {
                    let rest = std::mem::take(&mut self.pending);
                    return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
                }
            }
        }
    }

    async fn close(mut self) -> io::Result<()> {
        drop(self.stdin);
        match tokio::time::timeout(CLOSE_GRACE, self.child.wait()).await {
            Ok(status) => {
                debug!("ssh exited with {}", status?);
                Ok(())
            }
            Err(_) => {
                debug!("ssh did not exit after logout, killing it");
                self.child.kill().await
            }
        }
    }
}
