//! The SASL authentication engine: a line-based, CRLF-terminated text
//! protocol that runs before any D-Bus framing is enabled.
//!
//! The full client state machine — `CANCEL`/retry across a mechanism
//! preference list, `DATA`/challenge-response, and Unix-FD negotiation —
//! plus three mechanisms: `EXTERNAL` (hex-encoded local UID, no challenge
//! round trip needed), `DBUS_COOKIE_SHA1` (shared-secret challenge-response
//! via `sha1`/`hex`/`rand`), and `ANONYMOUS`.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};
use crate::transport::{Credentials, Transport};

/// The outcome of feeding a server line to a [`Mechanism`].
pub enum Step {
    /// Send `bytes` as the next `DATA` line and keep waiting for a reply.
    Continue(Vec<u8>),
    /// The mechanism is satisfied; send `bytes` (if any) as the final
    /// response and expect the server to answer `OK`.
    Done(Option<Vec<u8>>),
    /// The mechanism has failed; try the next one in the preference list.
    Error,
}

/// A pluggable SASL mechanism.
pub trait Mechanism: Send {
    /// The wire name sent in the `AUTH <name>` command.
    fn name(&self) -> &'static str;

    /// The initial response to send as the (optional) hex payload of the
    /// `AUTH` command, if any.
    fn initial_response(&mut self, credentials: &Credentials) -> Option<Vec<u8>>;

    /// Handle a `DATA <hex>` challenge from the server.
    fn process_challenge(&mut self, challenge: &[u8]) -> Step;
}

/// `EXTERNAL`: authenticates using the local Unix UID carried by the
/// transport's ancillary credentials. Accepts no challenges.
pub struct External;

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self, credentials: &Credentials) -> Option<Vec<u8>> {
        let uid = credentials.unix_uid?;
        Some(uid.to_string().into_bytes())
    }

    fn process_challenge(&mut self, _challenge: &[u8]) -> Step {
        Step::Error
    }
}

/// `ANONYMOUS`: no credentials are presented at all.
pub struct Anonymous;

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self, _credentials: &Credentials) -> Option<Vec<u8>> {
        None
    }

    fn process_challenge(&mut self, _challenge: &[u8]) -> Step {
        Step::Error
    }
}

/// `DBUS_COOKIE_SHA1`: a shared-secret challenge/response scheme using
/// cookies readable only by the local user.
pub struct CookieSha1 {
    keyring_dir: Option<PathBuf>,
}

impl CookieSha1 {
    /// Construct the mechanism, reading cookies from `~/.dbus-keyrings/`.
    pub fn new() -> Self {
        Self {
            keyring_dir: home_keyring_dir(),
        }
    }

    /// Construct the mechanism with an explicit keyring directory.
    ///
    /// Exposed as configuration rather than guessing a platform-specific
    /// default, since there is no portable way to locate the keyring
    /// directory on non-Unix targets.
    pub fn with_keyring_dir(dir: PathBuf) -> Self {
        Self {
            keyring_dir: Some(dir),
        }
    }
}

impl Default for CookieSha1 {
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism for CookieSha1 {
    fn name(&self) -> &'static str {
        "DBUS_COOKIE_SHA1"
    }

    fn initial_response(&mut self, _credentials: &Credentials) -> Option<Vec<u8>> {
        Some(whoami().into_bytes())
    }

    fn process_challenge(&mut self, challenge: &[u8]) -> Step {
        match self.respond(challenge) {
            Ok(response) => Step::Done(Some(response)),
            Err(_) => Step::Error,
        }
    }
}

impl CookieSha1 {
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| Error::from(ErrorKind::Corrupted("cookie challenge not UTF-8")))?;
        let mut parts = text.split_whitespace();
        let context = parts
            .next()
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("cookie challenge missing context")))?;
        let cookie_id = parts
            .next()
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("cookie challenge missing cookie id")))?;
        let server_challenge = parts
            .next()
            .ok_or_else(|| Error::from(ErrorKind::Corrupted("cookie challenge missing server challenge")))?;

        let cookie = self.read_cookie(context, cookie_id)?;

        let mut client_challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut client_challenge);
        let client_challenge = hex::encode(client_challenge);

        let mut hasher = Sha1::new();
        hasher.update(server_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(client_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(cookie.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Ok(format!("{client_challenge} {digest}").into_bytes())
    }

    fn read_cookie(&self, context: &str, cookie_id: &str) -> Result<String> {
        let dir = self
            .keyring_dir
            .clone()
            .ok_or_else(|| Error::from(ErrorKind::AuthFailed {
                mechanism: "DBUS_COOKIE_SHA1",
                reason: "no keyring directory available on this platform".into(),
            }))?;

        let path = dir.join(context);
        let metadata = fs::metadata(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode();

            if mode & 0o077 != 0 {
                return Err(ErrorKind::AuthFailed {
                    mechanism: "DBUS_COOKIE_SHA1",
                    reason: format!("keyring file {path:?} is group/other readable"),
                }
                .into());
            }
        }

        let contents = fs::read_to_string(&path)?;

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(id) = fields.next() else { continue };

            if id == cookie_id {
                let cookie = fields
                    .nth(1)
                    .ok_or_else(|| Error::from(ErrorKind::Corrupted("malformed cookie line")))?;
                return Ok(cookie.to_owned());
            }
        }

        Err(ErrorKind::AuthFailed {
            mechanism: "DBUS_COOKIE_SHA1",
            reason: format!("cookie id {cookie_id} not found in {context}"),
        }
        .into())
    }
}

fn home_keyring_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".dbus-keyrings"))
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

/// The client-side negotiation state, driven by lines received from the
/// server. `WaitingForAgreeUnixFd` is handled as a one-shot step after the
/// main loop rather than as a state here, since it can only ever be
/// entered once, after `OK`.
enum ClientState {
    WaitingForData,
    WaitingForOk,
    WaitingForRejected,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::WaitingForData => "WAITING_FOR_DATA",
            ClientState::WaitingForOk => "WAITING_FOR_OK",
            ClientState::WaitingForRejected => "WAITING_FOR_REJECT",
        };
        f.write_str(name)
    }
}

/// Runs the client side of the SASL handshake to completion, returning once
/// `BEGIN` has been sent and the stream is ready to be framed.
///
/// `mechanisms` is tried in order; each rejection advances to the next one.
/// Unix-FD negotiation is attempted (but not required to succeed) when
/// `negotiate_unix_fd` is set and the transport reports FD-passing support.
pub async fn authenticate<T>(
    transport: &mut T,
    mechanisms: Vec<Box<dyn Mechanism>>,
    negotiate_unix_fd: bool,
) -> Result<bool>
where
    T: Transport,
{
    let credentials = transport.credentials();
    transport.write_all(&[0]).await?;

    let mut reader = LineReader::new();
    let mut remaining = mechanisms.into_iter();

    let mut current = remaining
        .next()
        .ok_or_else(|| Error::from(ErrorKind::AuthFailed {
            mechanism: "none",
            reason: "no SASL mechanisms configured".into(),
        }))?;

    loop {
        let initial = current.initial_response(&credentials);
        send_auth(transport, current.name(), initial.as_deref()).await?;
        let mut state = ClientState::WaitingForData;

        loop {
            let line = reader.read_line(transport).await?;
            let (command, rest) = split_command(&line);

            match command {
                b"OK" => {
                    // The GUID that follows identifies the bus server; this
                    // client does not need it to proceed.
                    let _ = rest;
                    state = ClientState::WaitingForOk;
                    break;
                }
                b"DATA" => {
                    let challenge = hex::decode(trim(rest)).map_err(|_| {
                        Error::from(ErrorKind::Corrupted("DATA payload was not valid hex"))
                    })?;

                    match current.process_challenge(&challenge) {
                        Step::Continue(bytes) => {
                            send_data(transport, &bytes).await?;
                            state = ClientState::WaitingForData;
                        }
                        Step::Done(Some(bytes)) => {
                            send_data(transport, &bytes).await?;
                            state = ClientState::WaitingForOk;
                        }
                        Step::Done(None) => {
                            state = ClientState::WaitingForOk;
                        }
                        Step::Error => {
                            send_line(transport, b"CANCEL").await?;
                            state = ClientState::WaitingForRejected;
                        }
                    }
                }
                b"REJECTED" => {
                    state = ClientState::WaitingForRejected;
                    break;
                }
                b"ERROR" => {
                    send_line(transport, b"CANCEL").await?;
                    state = ClientState::WaitingForRejected;
                }
                _ => {
                    // Unknown server command: spec says neither side should
                    // disconnect, but a client only ever expects these four;
                    // treat it as a protocol error for this mechanism.
                    send_line(transport, b"CANCEL").await?;
                    state = ClientState::WaitingForRejected;
                }
            }

            if matches!(state, ClientState::WaitingForOk | ClientState::WaitingForRejected) {
                break;
            }
        }

        match state {
            ClientState::WaitingForOk => break,
            _ => {
                current = remaining.next().ok_or_else(|| {
                    Error::from(ErrorKind::AuthFailed {
                        mechanism: "exhausted",
                        reason: "every configured SASL mechanism was rejected".into(),
                    })
                })?;
                continue;
            }
        }
    }

    let got_unix_fds = if negotiate_unix_fd && transport.supports_unix_fd_passing() {
        send_line(transport, b"NEGOTIATE_UNIX_FD").await?;
        let line = reader.read_line(transport).await?;
        let (command, _) = split_command(&line);
        command == b"AGREE_UNIX_FD"
    } else {
        false
    };

    send_line(transport, b"BEGIN").await?;
    Ok(got_unix_fds)
}

async fn send_auth<T: Transport>(transport: &mut T, mechanism: &str, payload: Option<&[u8]>) -> Result<()> {
    let mut line = format!("AUTH {mechanism}").into_bytes();

    if let Some(payload) = payload {
        line.push(b' ');
        line.extend(hex::encode(payload).into_bytes());
    }

    send_line(transport, &line).await
}

async fn send_data<T: Transport>(transport: &mut T, payload: &[u8]) -> Result<()> {
    let mut line = b"DATA ".to_vec();
    line.extend(hex::encode(payload).into_bytes());
    send_line(transport, &line).await
}

async fn send_line<T: Transport>(transport: &mut T, line: &[u8]) -> Result<()> {
    transport.write_all(line).await?;
    transport.write_all(b"\r\n").await?;
    transport.flush().await?;
    Ok(())
}

fn split_command(line: &str) -> (&[u8], &str) {
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd.as_bytes(), rest),
        None => (line.trim_end().as_bytes(), ""),
    }
}

fn trim(s: &str) -> &str {
    s.trim()
}

/// Reads CRLF-terminated ASCII lines directly off the transport, used only
/// during the SASL phase before framed messages begin.
struct LineReader {
    carry: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        Self { carry: Vec::new() }
    }

    async fn read_line<T: Transport>(&mut self, transport: &mut T) -> Result<String> {
        loop {
            if let Some(idx) = self.carry.windows(2).position(|w| w == b"\r\n") {
                let line = self.carry.drain(..idx + 2).collect::<Vec<u8>>();
                let line = String::from_utf8(line[..line.len() - 2].to_vec())
                    .map_err(|e| Error::from(ErrorKind::InvalidUtf8(e.utf8_error())))?;
                return Ok(line);
            }

            let mut byte = [0u8; 1];
            let n = transport.read(&mut byte).await?;

            if n == 0 {
                return Err(ErrorKind::Corrupted("stream closed during SASL handshake").into());
            }

            self.carry.push(byte[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_sha1_matches_expected_digest() {
        let server_challenge = "deadbeef";
        let client_challenge = "cafef00d";
        let cookie = "supersecret";

        let mut hasher = Sha1::new();
        hasher.update(server_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(client_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(cookie.as_bytes());
        let expected = hex::encode(hasher.finalize());

        let mut hasher2 = Sha1::new();
        hasher2.update(format!("{server_challenge}:{client_challenge}:{cookie}").as_bytes());
        let expected2 = hex::encode(hasher2.finalize());

        assert_eq!(expected, expected2);
    }

    #[test]
    fn external_uses_uid_from_credentials() {
        let mut mech = External;
        let resp = mech.initial_response(&Credentials { unix_uid: Some(1000) });
        assert_eq!(resp, Some(b"1000".to_vec()));
    }

    #[test]
    fn external_has_no_credentials_without_uid() {
        let mut mech = External;
        assert_eq!(mech.initial_response(&Credentials { unix_uid: None }), None);
    }

    #[test]
    fn split_command_handles_payload_and_bare_commands() {
        assert_eq!(split_command("OK 1234abcd"), (&b"OK"[..], "1234abcd"));
        assert_eq!(split_command("BEGIN"), (&b"BEGIN"[..], ""));
    }

    #[cfg(unix)]
    #[test]
    fn group_readable_keyring_file_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!(
            "dbus-peer-keyring-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        let cookie_path = dir.join("org_example_testsuite");
        fs::write(&cookie_path, "1 1700000000 supersecret\n").unwrap();
        fs::set_permissions(&cookie_path, fs::Permissions::from_mode(0o644)).unwrap();

        let mech = CookieSha1::with_keyring_dir(dir.clone());
        let err = mech
            .read_cookie("org_example_testsuite", "1")
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AuthFailed { mechanism: "DBUS_COOKIE_SHA1", .. }));

        fs::remove_dir_all(&dir).unwrap();
    }
}
