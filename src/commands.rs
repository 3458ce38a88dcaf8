use crate::address::{TargetAddr, encode_socket_addr};
use crate::policy::AccessPolicy;
use crate::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use anyhow::{Result, bail};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Bound address carried by failure replies
const UNSPECIFIED_BIND: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Request is a parsed client request following the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: TargetAddr,
}

/// read_request reads the client's request. Malformed requests get a coded
/// failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reqbuf = [0u8; 4];
    stream.read_exact(&mut reqbuf).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not checking RSV (RESERVED) -> 0x00
    let atyp = reqbuf[3];

    if version != Version::SOCKS5 as u8 {
        send_reply(stream, ReplyCode::ServerFailure, UNSPECIFIED_BIND).await?;
        bail!("not SOCKS5: request version {:#04x}", version);
    }

    let Some(addr_type) = AddressType::from_byte(atyp) else {
        send_reply(stream, ReplyCode::AddrTypeUnsupported, UNSPECIFIED_BIND).await?;
        bail!("unsupported address type {:#04x}", atyp);
    };

    let target = match TargetAddr::read_from(stream, addr_type).await {
        Ok(target) => target,
        Err(e) => {
            // The client may already be gone, the parse error is what matters
            let _ = send_reply(stream, ReplyCode::ServerFailure, UNSPECIFIED_BIND).await;
            return Err(e);
        }
    };

    let Some(command) = Command::from_byte(command) else {
        send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED_BIND).await?;
        bail!("unknown command {:#04x}", command);
    };

    Ok(Request { command, target })
}

/// dispatch carries out a request. On success the open destination stream
/// is returned and the success reply has been written; every failure has
/// been answered with its reply code.
pub async fn dispatch<S>(
    stream: &mut S,
    request: Request,
    policy: &AccessPolicy,
    connect_timeout: Duration,
) -> Result<TcpStream>
where
    S: AsyncWrite + Unpin,
{
    match request.command {
        Command::Connect => {
            handle_connect_cmd(stream, &request.target, policy, connect_timeout).await
        }
        Command::Bind | Command::UdpAssociate => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED_BIND).await?;
            bail!("{:?} not supported", request.command)
        }
    }
}

/// handle_connect_cmd checks the destination against policy, then opens the
/// outbound connection within `connect_timeout`
async fn handle_connect_cmd<S>(
    stream: &mut S,
    target: &TargetAddr,
    policy: &AccessPolicy,
    connect_timeout: Duration,
) -> Result<TcpStream>
where
    S: AsyncWrite + Unpin,
{
    if !policy.allows_destination(target) {
        warn!("destination {} not allowed by ruleset", target);
        send_reply(stream, ReplyCode::ConnectionNotAllowed, UNSPECIFIED_BIND).await?;
        bail!("destination {target} not allowed by ruleset");
    }

    match tokio::time::timeout(connect_timeout, connect_target(target)).await {
        Ok(Ok(outbound)) => {
            let bound = outbound.local_addr()?;
            send_reply(stream, ReplyCode::Succeeded, bound).await?;
            info!("connected to {} via {}", target, bound);
            Ok(outbound)
        }
        Ok(Err(e)) => {
            let reply_code = ReplyCode::from(e.kind());
            debug!("connect to {} failed: {} -> {:?}", target, e, reply_code);
            send_reply(stream, reply_code, UNSPECIFIED_BIND).await?;
            Err(e.into())
        }
        Err(_) => {
            send_reply(stream, ReplyCode::HostUnreachable, UNSPECIFIED_BIND).await?;
            bail!("connect to {target} timed out after {connect_timeout:?}")
        }
    }
}

/// connect_target resolves the target and tries each address in order
async fn connect_target(target: &TargetAddr) -> io::Result<TcpStream> {
    let addrs = target
        .resolve()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::HostUnreachable, e))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(outbound) => return Ok(outbound),
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::HostUnreachable)))
}

/// encode_reply builds a request reply frame
pub fn encode_reply(reply_code: ReplyCode, bound_addr: SocketAddr) -> Vec<u8> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];
    encode_socket_addr(&mut reply, bound_addr);
    reply
}

async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply_code, bound_addr)).await?;
    stream.flush().await?;
    Ok(())
}
