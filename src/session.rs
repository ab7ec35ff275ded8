//! Expect-style driver for one interactive shell session.
//!
//! Each call to [`SessionDriver::run_command`] opens a fresh connection, walks
//! the login handshake, runs a single command, captures its output up to the
//! next shell prompt and then logs out. Text received from the transport is
//! classified against a fixed set of signatures; when several are present the
//! one that starts earliest wins, ties going to the first in [`Signal`] order.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};

/// Last line of the buffer ending in `#` or `$`.
pub const DEFAULT_PROMPT: &str = r"[^\n]*[#$]\s*$";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_HOST_KEY: &str = "yes";
const LOGOUT: &str = "exit";

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    KeyFile(PathBuf),
    Password(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub credential: Credential,
    pub accept_new_host_keys: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    pub command: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            command: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("timed out waiting for the remote shell")]
    Timeout,
    #[error("unexpected response from remote shell: {0}")]
    UnexpectedResponse(String),
    #[error("remote host key has changed")]
    HostKeyChanged,
    #[error("host key verification failed")]
    HostKeyVerificationFailed,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("permission denied")]
    PermissionDenied,
    #[error("connection closed before the shell was ready")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Io(String),
}

/// A bidirectional text stream to a remote shell.
pub trait ShellTransport: Send {
    fn send_line(&mut self, line: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Next chunk of output, `None` once the stream has ended.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;

    fn close(self) -> impl Future<Output = io::Result<()>> + Send;
}

pub trait Connector: Send + Sync {
    type Transport: ShellTransport;

    fn connect(&self, target: &SshTarget)
    -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Text signatures recognized while logging in, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Prompt,
    Nothing,
    HostKeyConfirm,
    HostKeyVerificationFailed,
    ConnectionRefused,
    ConnectionTimedOut,
    HostKeyChanged,
    PermissionDenied,
    PasswordPrompt,
}

#[derive(Debug)]
struct Patterns {
    handshake: Vec<(Signal, Regex)>,
    command: Vec<(Signal, Regex)>,
}

impl Patterns {
    fn new(prompt: &str) -> Result<Self, regex::Error> {
        let prompt = Regex::new(prompt)?;
        let handshake = vec![
            (Signal::Prompt, prompt.clone()),
            (Signal::Nothing, Regex::new(r"(?m)^nothing\s*$")?),
            (
                Signal::HostKeyConfirm,
                Regex::new(r"\(yes/no(?:/\[fingerprint\])?\)\?")?,
            ),
            (
                Signal::HostKeyVerificationFailed,
                Regex::new(r"Host key verification failed")?,
            ),
            (Signal::ConnectionRefused, Regex::new(r"(?i)connection refused")?),
            (Signal::ConnectionTimedOut, Regex::new(r"(?i)connection timed out")?),
            (
                Signal::HostKeyChanged,
                Regex::new(r"REMOTE HOST IDENTIFICATION HAS CHANGED")?,
            ),
            (Signal::PermissionDenied, Regex::new(r"(?i)permission denied")?),
            (Signal::PasswordPrompt, Regex::new(r"(?i)password:\s*$")?),
        ];
        Ok(Patterns {
            handshake,
            command: vec![(Signal::Prompt, prompt)],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Matched { signal: Signal, before: String },
    Timeout,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connecting,
    AwaitingPrompt,
    ConfirmingHostKey,
    Authenticating,
    AwaitingCommandPrompt,
    Closed,
    Failed(SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    None,
    AcceptHostKey,
    SendPassword,
    SendCommand,
    Capture(String),
}

fn transition(state: &SessionState, event: Event, has_password: bool) -> (SessionState, Action) {
    use SessionState::*;

    let signal = match event {
        Event::Timeout => return (Failed(SessionError::Timeout), Action::None),
        Event::Eof => return (Failed(SessionError::ConnectionClosed), Action::None),
        Event::Matched { signal, before } => {
            if *state == AwaitingCommandPrompt {
                return match signal {
                    Signal::Prompt => (Closed, Action::Capture(before)),
                    other => (
                        Failed(SessionError::UnexpectedResponse(format!("{other:?}"))),
                        Action::None,
                    ),
                };
            }
            signal
        }
    };

    let failure = |error| (Failed(error), Action::None);
    match (state, signal) {
        (_, Signal::Prompt) => (AwaitingCommandPrompt, Action::SendCommand),
        (AwaitingPrompt, Signal::HostKeyConfirm) => (ConfirmingHostKey, Action::AcceptHostKey),
        (_, Signal::HostKeyConfirm) => failure(SessionError::UnexpectedResponse(
            "repeated host key confirmation".to_string(),
        )),
        (AwaitingPrompt | ConfirmingHostKey, Signal::PasswordPrompt) if has_password => {
            (Authenticating, Action::SendPassword)
        }
        (_, Signal::PasswordPrompt) => failure(SessionError::PermissionDenied),
        (_, Signal::Nothing) => failure(SessionError::UnexpectedResponse("nothing".to_string())),
        (_, Signal::HostKeyVerificationFailed) => {
            failure(SessionError::HostKeyVerificationFailed)
        }
        (_, Signal::ConnectionRefused) => failure(SessionError::ConnectionRefused),
        (_, Signal::ConnectionTimedOut) => failure(SessionError::ConnectionTimedOut),
        (_, Signal::HostKeyChanged) => failure(SessionError::HostKeyChanged),
        (_, Signal::PermissionDenied) => failure(SessionError::PermissionDenied),
    }
}

/// Buffers transport output and consumes it one match at a time.
struct Expect<T> {
    transport: T,
    buffer: String,
}

impl<T: ShellTransport> Expect<T> {
    fn new(transport: T) -> Self {
        Expect {
            transport,
            buffer: String::new(),
        }
    }

    fn classify(&self, patterns: &[(Signal, Regex)]) -> Option<(Signal, usize, usize)> {
        patterns
            .iter()
            .filter_map(|(signal, pattern)| {
                pattern
                    .find(&self.buffer)
                    .map(|found| (*signal, found.start(), found.end()))
            })
            .min_by_key(|(_, start, _)| *start)
    }

    async fn expect(
        &mut self,
        patterns: &[(Signal, Regex)],
        deadline: Instant,
    ) -> Result<Event, SessionError> {
        loop {
            if let Some((signal, start, end)) = self.classify(patterns) {
                let before = self.buffer[..start].to_string();
                self.buffer.drain(..end);
                return Ok(Event::Matched { signal, before });
            }

            match timeout_at(deadline, self.transport.recv()).await {
                Err(_) => return Ok(Event::Timeout),
                Ok(Ok(Some(chunk))) => self.buffer.push_str(&chunk.replace('\r', "")),
                Ok(Ok(None)) => return Ok(Event::Eof),
                Ok(Err(err)) => return Err(SessionError::Io(err.to_string())),
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.transport
            .send_line(line)
            .await
            .map_err(|err| SessionError::Io(err.to_string()))
    }
}

pub struct SessionDriver<C> {
    connector: C,
    target: SshTarget,
    patterns: Patterns,
    timeouts: SessionTimeouts,
}

impl<C: Connector> SessionDriver<C> {
    pub fn new(
        connector: C,
        target: SshTarget,
        prompt: &str,
        timeouts: SessionTimeouts,
    ) -> Result<Self, regex::Error> {
        Ok(SessionDriver {
            connector,
            target,
            patterns: Patterns::new(prompt)?,
            timeouts,
        })
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    #[cfg(test)]
    pub(crate) fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs `command` in a fresh session and returns everything it printed
    /// before the shell prompt came back.
    pub async fn run_command(&self, command: &str) -> Result<String, SessionError> {
        let host = &self.target.host;
        let mut state = SessionState::Connecting;
        debug!("{host}: {state:?}");

        let transport = self
            .connector
            .connect(&self.target)
            .await
            .map_err(|err| SessionError::Io(err.to_string()))?;
        let mut session = Expect::new(transport);

        state = SessionState::AwaitingPrompt;
        let mut deadline = Instant::now() + self.timeouts.handshake;
        let mut output = None;

        while !matches!(state, SessionState::Closed | SessionState::Failed(_)) {
            let patterns = if state == SessionState::AwaitingCommandPrompt {
                &self.patterns.command
            } else {
                &self.patterns.handshake
            };
            let event = match session.expect(patterns, deadline).await {
                Ok(event) => event,
                Err(err) => {
                    state = SessionState::Failed(err);
                    break;
                }
            };

            let (next, action) = transition(&state, event, self.has_password());
            debug!("{host}: {state:?} -> {next:?}");
            state = next;

            let sent = match action {
                Action::None => Ok(()),
                Action::AcceptHostKey => {
                    warn!("{host}: accepting unknown host key");
                    session.send_line(ACCEPT_HOST_KEY).await
                }
                Action::SendPassword => match &self.target.credential {
                    Credential::Password(password) => session.send_line(password).await,
                    Credential::KeyFile(_) => Ok(()),
                },
                Action::SendCommand => session.send_line(command).await,
                Action::Capture(before) => {
                    output = Some(before);
                    Ok(())
                }
            };
            if let Err(err) = sent {
                state = SessionState::Failed(err);
                break;
            }

            let timeout = match state {
                SessionState::AwaitingCommandPrompt => self.timeouts.command,
                _ => self.timeouts.handshake,
            };
            deadline = Instant::now() + timeout;
        }

        if state == SessionState::Closed {
            if let Err(err) = session.send_line(LOGOUT).await {
                debug!("{host}: logout failed: {err}");
            }
        }
        if let Err(err) = session.transport.close().await {
            warn!("{host}: error closing session: {err}");
        }

        match (state, output) {
            (SessionState::Closed, Some(output)) => Ok(output),
            (SessionState::Failed(err), _) => Err(err),
            (state, _) => Err(SessionError::UnexpectedResponse(format!(
                "session ended in {state:?}"
            ))),
        }
    }

    fn has_password(&self) -> bool {
        matches!(self.target.credential, Credential::Password(_))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) enum Chunk {
        Text(String),
        Eof,
        /// Never produces output.
        Stall,
    }

    pub(crate) fn text(s: &str) -> Chunk {
        Chunk::Text(s.to_string())
    }

    pub(crate) struct ScriptedTransport {
        chunks: VecDeque<Chunk>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ShellTransport for ScriptedTransport {
        async fn send_line(&mut self, line: &str) -> io::Result<()> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> io::Result<Option<String>> {
            match self.chunks.pop_front() {
                Some(Chunk::Text(text)) => Ok(Some(text)),
                Some(Chunk::Stall) => std::future::pending().await,
                Some(Chunk::Eof) | None => Ok(None),
            }
        }

        async fn close(self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out one scripted session per connect; refuses once exhausted.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        sessions: Mutex<VecDeque<Vec<Chunk>>>,
        sent: Arc<Mutex<Vec<String>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        pub(crate) fn new(sessions: Vec<Vec<Chunk>>) -> Self {
            ScriptedConnector {
                sessions: Mutex::new(sessions.into()),
                ..Default::default()
            }
        }

        pub(crate) fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Connector for ScriptedConnector {
        type Transport = ScriptedTransport;

        async fn connect(&self, _target: &SshTarget) -> io::Result<ScriptedTransport> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let chunks = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no script"))?;
            Ok(ScriptedTransport {
                chunks: chunks.into(),
                sent: self.sent.clone(),
            })
        }
    }

    pub(crate) const PROMPT: &str = "root@OpenWrt:~# ";

    /// A clean login followed by `arp` printing `lines`.
    pub(crate) fn arp_session(lines: &[&str]) -> Vec<Chunk> {
        let mut output = String::from("arp\r\n");
        for line in lines {
            output.push_str(line);
            output.push_str("\r\n");
        }
        output.push_str(PROMPT);
        vec![text(PROMPT), Chunk::Text(output)]
    }

    pub(crate) fn target(credential: Credential) -> SshTarget {
        SshTarget {
            host: "192.168.1.1".to_string(),
            port: None,
            username: "root".to_string(),
            credential,
            accept_new_host_keys: false,
        }
    }

    pub(crate) fn key_target() -> SshTarget {
        target(Credential::KeyFile(PathBuf::from("/root/.ssh/id_ed25519")))
    }
}
