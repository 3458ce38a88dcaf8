use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Buffer size for each relay direction
const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Relay pumps bytes between a client and its destination once CONNECT
/// has succeeded
pub struct Relay<A, B> {
    pub inbound: A,
    pub outbound: B,
    pub idle_timeout: Duration,
}

/// Relay implementation block
impl<A, B> Relay<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    /// run copies both directions concurrently. Whichever finishes first
    /// (EOF, I/O error or the idle timeout) ends the relay, and both
    /// streams are dropped, which closes them.
    pub async fn run(self) -> Result<()> {
        let (mut client_read, mut client_write) = tokio::io::split(self.inbound);
        let (mut server_read, mut server_write) = tokio::io::split(self.outbound);

        let start = Instant::now();
        let activity = Activity::new();
        let from_client = AtomicU64::new(0);
        let from_server = AtomicU64::new(0);

        let client_to_server = pump(
            &mut client_read,
            &mut server_write,
            &from_client,
            &activity,
            start,
        );
        let server_to_client = pump(
            &mut server_read,
            &mut client_write,
            &from_server,
            &activity,
            start,
        );

        tokio::select! {
            result = client_to_server => {
                if let Err(e) = result {
                    debug!("client->server error: {}", e);
                }
            }
            result = server_to_client => {
                if let Err(e) = result {
                    debug!("server->client error: {}", e);
                }
            }
            _ = idle_watchdog(&activity, start, self.idle_timeout) => {
                debug!("relay idle for {:?}, closing", self.idle_timeout);
            }
        }

        // DEBUG
        info!(
            "connection closed: {} bytes from client, {} bytes from server",
            from_client.load(Ordering::Relaxed),
            from_server.load(Ordering::Relaxed)
        );

        Ok(())
    }
}

/// Activity records when bytes last moved in either direction, as
/// milliseconds since the relay started
struct Activity(AtomicU64);

impl Activity {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn touch(&self, start: Instant) {
        self.0
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last(&self, start: Instant) -> Instant {
        start + Duration::from_millis(self.0.load(Ordering::Relaxed))
    }
}

/// pump copies one direction until EOF or error, then shuts the writer
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
    start: Instant,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch(start);
    }
    writer.shutdown().await
}

/// idle_watchdog resolves once no bytes have moved for `idle_timeout`
async fn idle_watchdog(activity: &Activity, start: Instant, idle_timeout: Duration) {
    loop {
        // A timeout past the clock's range never fires
        let Some(deadline) = activity.last(start).checked_add(idle_timeout) else {
            return std::future::pending().await;
        };
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
