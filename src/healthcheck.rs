//! Liveness probe for a running proxy.
//!
//! Speaks the client side of the greeting and, when the server picks it,
//! username/password authentication. No request is sent, so relaying is
//! not exercised.

use crate::auth::Credentials;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use anyhow::{Context, Result, anyhow, bail};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// HealthCheck dials `addr` and reports whether the handshake succeeds
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub addr: String,
    pub credentials: Option<Credentials>,
}

impl HealthCheck {
    pub fn new(addr: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            addr: addr.into(),
            credentials,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow!("cannot connect to {}: timed out", self.addr))?
            .with_context(|| format!("cannot connect to {}", self.addr))?;

        probe(&mut stream, self.credentials.as_ref()).await
    }
}

/// probe runs the client half of the handshake on an open stream
pub async fn probe<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Always offer both no-auth and username/password
    let greeting = [
        Version::SOCKS5 as u8,
        0x02,
        AuthMethod::NoAuth as u8,
        AuthMethod::UserPass as u8,
    ];
    stream
        .write_all(&greeting)
        .await
        .context("cannot write greeting")?;

    let mut response = [0u8; 2];
    read_with_deadline(stream, &mut response)
        .await
        .context("cannot read response")?;

    if response[0] != Version::SOCKS5 as u8 {
        bail!("invalid SOCKS version: {}", response[0]);
    }

    match AuthMethod::from_byte(response[1]) {
        Some(AuthMethod::NoAuth) => Ok(()),
        Some(AuthMethod::UserPass) => {
            let creds = credentials.ok_or_else(|| {
                anyhow!("server requires auth but PROXY_USER/PROXY_PASSWORD not set")
            })?;
            authenticate(stream, creds).await
        }
        Some(AuthMethod::NoAcceptable) => bail!("server accepted none of the offered methods"),
        None => bail!("server selected unknown method {:#04x}", response[1]),
    }
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_userpass(creds)?;
    stream
        .write_all(&request)
        .await
        .context("cannot write auth")?;

    let mut response = [0u8; 2];
    read_with_deadline(stream, &mut response)
        .await
        .context("cannot read auth response")?;

    if response[0] != USERPASS_VERSION {
        bail!("invalid auth version: {}", response[0]);
    }
    if response[1] != AuthStatus::Success as u8 {
        bail!("authentication failed");
    }
    Ok(())
}

/// encode_userpass builds an RFC 1929 request; fields longer than 255
/// bytes cannot be represented
fn encode_userpass(creds: &Credentials) -> Result<Vec<u8>> {
    let user = creds.username().as_bytes();
    let pass = creds.password().as_bytes();
    let ulen = u8::try_from(user.len()).map_err(|_| anyhow!("username too long"))?;
    let plen = u8::try_from(pass.len()).map_err(|_| anyhow!("password too long"))?;

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(USERPASS_VERSION);
    request.push(ulen);
    request.extend_from_slice(user);
    request.push(plen);
    request.extend_from_slice(pass);
    Ok(request)
}

async fn read_with_deadline<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    timeout(READ_TIMEOUT, stream.read_exact(buf))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    Ok(())
}
