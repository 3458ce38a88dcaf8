//! Test utilities shared by the integration tests

#![allow(dead_code)]

use socksgate::Socks5Server;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Upper bound for any single step in a test
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a TCP echo server on an ephemeral loopback port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// A listener whose accept queue is full, so new connects hang. Keep the
/// returned values alive for as long as the stall is needed.
pub async fn stalled_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }
    (listener, queued, addr)
}

/// Bind `server` on an ephemeral loopback port and run it in the background
pub async fn start_proxy(server: Socks5Server) -> SocketAddr {
    let mut server = server;
    let addr = server.bind().await.unwrap();
    tokio::spawn(server.run());
    addr
}

/// A proxy bound to loopback, ready for builder calls
pub fn loopback_server() -> Socks5Server {
    Socks5Server::new("127.0.0.1:0")
}

/// Send a greeting and return the method selection reply
pub async fn greet(stream: &mut TcpStream, methods: &[u8]) -> [u8; 2] {
    let mut greeting = vec![0x05, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Send a username/password request and return the auth reply
pub async fn login(stream: &mut TcpStream, username: &str, password: &str) -> [u8; 2] {
    let mut request = vec![0x01, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Send a request for a domain target and return the reply code
pub async fn request_domain(stream: &mut TcpStream, cmd: u8, host: &str, port: u16) -> u8 {
    let mut request = vec![0x05, cmd, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    read_reply(stream).await
}

/// Send a request for an IP target and return the reply code
pub async fn request_ip(stream: &mut TcpStream, cmd: u8, addr: SocketAddr) -> u8 {
    let mut request = vec![0x05, cmd, 0x00];
    match addr {
        SocketAddr::V4(v4) => {
            request.push(0x01);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(0x04);
            request.extend_from_slice(&v6.ip().octets());
        }
    }
    request.extend_from_slice(&addr.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    read_reply(stream).await
}

/// Read a complete request reply and return REP
pub async fn read_reply(stream: &mut TcpStream) -> u8 {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        other => panic!("unexpected ATYP {other:#04x}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    head[1]
}

/// Assert the peer closes without sending anything more
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let read = tokio::time::timeout(STEP_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("connection was not closed");
    // A reset is as good as a clean close here
    if read.is_ok() {
        assert!(buf.is_empty(), "unexpected bytes: {buf:02x?}");
    }
}
