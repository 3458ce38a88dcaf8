mod common;

use common::*;
use socksgate::{AccessPolicy, Credentials, HealthCheck, HostPattern, Timeouts};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT: u8 = 0x01;
const BIND: u8 = 0x02;

fn alice() -> Option<Credentials> {
    Some(Credentials::new("alice", "secret"))
}

fn example_policy() -> AccessPolicy {
    AccessPolicy::new().with_destination_pattern(Some(HostPattern::parse("*.example.com").unwrap()))
}

#[tokio::test]
async fn test_rejected_source_gets_no_bytes() {
    let policy = AccessPolicy::new().with_allowed_sources(["10.0.0.5".parse().unwrap()]);
    let proxy = start_proxy(loopback_server().with_auth(alice()).with_policy(policy)).await;

    // The test connects from 127.0.0.1, which is not on the list
    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_allowed_source_reaches_handshake() {
    let policy = AccessPolicy::new().with_allowed_sources(["127.0.0.1".parse().unwrap()]);
    let proxy = start_proxy(loopback_server().with_policy(policy)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);
}

#[tokio::test]
async fn test_no_auth_offer_refused_when_credentials_configured() {
    let proxy = start_proxy(loopback_server().with_auth(alice())).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0xFF]);
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_wrong_password_never_relays() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    let proxy = start_proxy(loopback_server().with_auth(alice())).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00, 0x02]).await, [0x05, 0x02]);
    assert_eq!(login(&mut client, "alice", "wrong").await, [0x01, 0x01]);

    // A request sent anyway must go nowhere
    let mut request = vec![0x05, CONNECT, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    let _ = client.write_all(&request).await;
    assert_closed(&mut client).await;

    let accepted = tokio::time::timeout(Duration::from_millis(200), destination.accept()).await;
    assert!(accepted.is_err());
}

#[tokio::test]
async fn test_destination_outside_pattern_is_not_allowed() {
    let proxy = start_proxy(
        loopback_server()
            .with_auth(alice())
            .with_policy(example_policy()),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00, 0x02]).await, [0x05, 0x02]);
    assert_eq!(login(&mut client, "alice", "secret").await, [0x01, 0x00]);
    assert_eq!(request_domain(&mut client, CONNECT, "evil.com", 80).await, 0x02);
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_ip_literal_outside_pattern_is_not_allowed() {
    let echo = spawn_echo_server().await;
    let proxy = start_proxy(loopback_server().with_policy(example_policy())).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);
    assert_eq!(request_ip(&mut client, CONNECT, echo).await, 0x02);
}

#[tokio::test]
async fn test_authenticated_connect_relays_both_ways() {
    let echo = spawn_echo_server().await;
    let policy =
        AccessPolicy::new().with_destination_pattern(Some(HostPattern::parse("localhost").unwrap()));
    let proxy = start_proxy(loopback_server().with_auth(alice()).with_policy(policy)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00, 0x02]).await, [0x05, 0x02]);
    assert_eq!(login(&mut client, "alice", "secret").await, [0x01, 0x00]);
    assert_eq!(
        request_domain(&mut client, CONNECT, "localhost", echo.port()).await,
        0x00
    );

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
    let (mut reader, mut writer) = client.into_split();
    let expected = payload.clone();
    let write_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; expected.len()];
    tokio::time::timeout(STEP_TIMEOUT, reader.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, expected);
    drop(write_task.await.unwrap());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let echo = spawn_echo_server().await;
    let proxy = start_proxy(loopback_server()).await;

    let mut first = TcpStream::connect(proxy).await.unwrap();
    let mut second = TcpStream::connect(proxy).await.unwrap();
    for client in [&mut first, &mut second] {
        assert_eq!(greet(client, &[0x00]).await, [0x05, 0x00]);
        assert_eq!(request_ip(client, CONNECT, echo).await, 0x00);
    }

    first.write_all(b"first").await.unwrap();
    second.write_all(b"second").await.unwrap();

    let mut buf = [0u8; 6];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second");
    let mut buf = [0u8; 5];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"first");

    // Closing one session leaves the other relaying
    drop(first);
    second.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn test_bind_gets_command_not_supported() {
    let proxy = start_proxy(loopback_server()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);
    assert_eq!(
        request_ip(&mut client, BIND, "127.0.0.1:0".parse().unwrap()).await,
        0x07
    );
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_refused_destination_maps_reply_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);
    let proxy = start_proxy(loopback_server()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);
    assert_eq!(request_ip(&mut client, CONNECT, closed).await, 0x05);
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    let timeouts = Timeouts {
        handshake: Duration::from_millis(100),
        connect: Duration::from_millis(100),
        ..Timeouts::default()
    };
    let proxy = start_proxy(loopback_server().with_timeouts(timeouts)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_healthcheck_against_running_proxy() {
    let proxy = start_proxy(loopback_server().with_auth(alice())).await;

    let check = HealthCheck::new(proxy.to_string(), alice());
    check.run().await.unwrap();

    let check = HealthCheck::new(proxy.to_string(), None);
    assert!(check.run().await.is_err());

    let open_proxy = start_proxy(loopback_server()).await;
    HealthCheck::new(open_proxy.to_string(), None)
        .run()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_slow_client_still_gets_connect_timeout_reply() {
    let (_listener, _queued, stalled) = stalled_listener().await;
    let timeouts = Timeouts {
        handshake: Duration::from_millis(500),
        connect: Duration::from_millis(300),
        ..Timeouts::default()
    };
    let proxy = start_proxy(loopback_server().with_timeouts(timeouts)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);

    // Use most of the handshake budget before sending the request
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(request_ip(&mut client, CONNECT, stalled).await, 0x04);
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_late_request_closed_at_handshake_deadline() {
    let echo = spawn_echo_server().await;
    let timeouts = Timeouts {
        handshake: Duration::from_millis(200),
        connect: Duration::from_secs(5),
        ..Timeouts::default()
    };
    let proxy = start_proxy(loopback_server().with_timeouts(timeouts)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut client, &[0x00]).await, [0x05, 0x00]);

    // The request arrives after the handshake deadline
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut request = vec![0x05, CONNECT, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    let _ = client.write_all(&request).await;
    assert_closed(&mut client).await;
}
