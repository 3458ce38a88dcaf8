//! Method negotiation and username/password authentication.
//!
//! [`Handshake`] is the per-connection state machine. Its transitions are
//! plain functions of the bytes already read, so they can be exercised
//! without a socket; [`negotiate`] drives it over a stream.

use crate::auth::Credentials;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// HandshakeState tracks where a connection is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing read yet
    AwaitingGreeting,
    /// Username/password was chosen, the auth request is next
    AwaitingAuth,
    /// Handshake finished with the given method, requests may follow
    Ready(AuthMethod),
    /// Terminal: the connection must be closed
    Failed,
}

/// Handshake holds the state of one connection's negotiation
#[derive(Debug)]
pub struct Handshake<'a> {
    state: HandshakeState,
    credentials: Option<&'a Credentials>,
}

impl<'a> Handshake<'a> {
    pub fn new(credentials: Option<&'a Credentials>) -> Self {
        Self {
            state: HandshakeState::AwaitingGreeting,
            credentials,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// on_greeting consumes the client's method list and returns the
    /// method selection reply to send
    pub fn on_greeting(&mut self, client_methods: &[u8]) -> Result<[u8; 2]> {
        if self.state != HandshakeState::AwaitingGreeting {
            self.state = HandshakeState::Failed;
            bail!("unexpected greeting");
        }

        let method = select_auth_method(client_methods, self.credentials.is_some());
        self.state = match method {
            AuthMethod::NoAuth => HandshakeState::Ready(AuthMethod::NoAuth),
            AuthMethod::UserPass => HandshakeState::AwaitingAuth,
            AuthMethod::NoAcceptable => HandshakeState::Failed,
        };

        Ok([Version::SOCKS5 as u8, method as u8])
    }

    /// on_auth_request checks the presented credentials and returns the
    /// auth reply to send. A failure is final for this connection.
    pub fn on_auth_request(&mut self, username: &[u8], password: &[u8]) -> Result<[u8; 2]> {
        if self.state != HandshakeState::AwaitingAuth {
            self.state = HandshakeState::Failed;
            bail!("unexpected auth request");
        }

        let creds = self
            .credentials
            .ok_or_else(|| anyhow!("username/password selected but not configured"))?;

        let status = if creds.verify(username, password) {
            self.state = HandshakeState::Ready(AuthMethod::UserPass);
            AuthStatus::Success
        } else {
            self.state = HandshakeState::Failed;
            AuthStatus::Failure
        };

        Ok([USERPASS_VERSION, status as u8])
    }
}

/// select_auth_method picks the strongest method this server supports that
/// the client also offered. Configured credentials make username/password
/// the only acceptable method.
pub fn select_auth_method(client_methods: &[u8], has_credentials: bool) -> AuthMethod {
    let supported: &[AuthMethod] = if has_credentials {
        &[AuthMethod::UserPass]
    } else {
        &[AuthMethod::NoAuth]
    };

    for &preferred in supported {
        if client_methods.contains(&(preferred as u8)) {
            return preferred;
        }
    }

    AuthMethod::NoAcceptable
}

/// negotiate runs the handshake over `stream` and returns the method in
/// effect once the client may send its request
pub async fn negotiate<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(credentials);

    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != Version::SOCKS5 as u8 {
        bail!("not SOCKS5: version {:#04x}", buf[0]);
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    // ServerChoice
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    let reply = handshake.on_greeting(&methods)?;
    stream.write_all(&reply).await?;
    stream.flush().await?;

    match handshake.state() {
        HandshakeState::Ready(method) => {
            debug!("selected method {:?}", method);
            return Ok(method);
        }
        HandshakeState::AwaitingAuth => (),
        _ => bail!("no acceptable authentication method in {:02x?}", methods),
    }

    let (username, password) = read_userpass_request(stream).await?;
    let reply = handshake.on_auth_request(&username, &password)?;
    stream.write_all(&reply).await?;
    stream.flush().await?;

    match handshake.state() {
        HandshakeState::Ready(method) => {
            debug!("user '{}' authenticated", String::from_utf8_lossy(&username));
            Ok(method)
        }
        _ => {
            warn!(
                "authentication failed for user '{}'",
                String::from_utf8_lossy(&username)
            );
            bail!("authentication failed")
        }
    }
}

/// read_userpass_request reads an RFC 1929 request and returns the raw
/// username and password
async fn read_userpass_request<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let version = stream.read_u8().await?;
    if version != USERPASS_VERSION {
        bail!("invalid username/password version {:#04x}", version);
    }

    let username_len = stream.read_u8().await?;
    let mut username = vec![0u8; username_len as usize];
    stream.read_exact(&mut username).await?;

    let password_len = stream.read_u8().await?;
    let mut password = vec![0u8; password_len as usize];
    stream.read_exact(&mut password).await?;

    Ok((username, password))
}
