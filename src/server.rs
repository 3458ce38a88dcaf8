use crate::{
    auth::Credentials,
    commands::{self, Request},
    handshake,
    policy::AccessPolicy,
    relay::Relay,
};
use anyhow::{Result, anyhow};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Timeouts bounds how long a session may wait on its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Greeting, authentication and request must complete within this
    pub handshake: Duration,
    /// DNS resolution plus the outbound connect
    pub connect: Duration,
    /// Relay closes after this long without traffic in either direction
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            idle: Duration::from_secs(15 * 60),
        }
    }
}

/// SessionContext is the read-only state every session shares
#[derive(Debug, Default)]
pub struct SessionContext {
    pub credentials: Option<Credentials>,
    pub policy: AccessPolicy,
    pub timeouts: Timeouts,
}

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    context: SessionContext,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            context: SessionContext::default(),
            listener: None,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.context.credentials = auth;
        self
    }

    /// with_policy applies source and destination access rules
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.context.policy = policy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.context.timeouts = timeouts;
        self
    }

    /// bind to the listen address; fails when already bound
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            return Err(anyhow!("server is already bound"));
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections forever, one task per session
    pub async fn run(mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener
                    .take()
                    .ok_or_else(|| anyhow!("listener missing after bind"))?
            }
        };

        let context = Arc::new(self.context);

        // Listen for connections to proxy
        loop {
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    // Back off so fd exhaustion does not spin the loop
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            // Source rule runs before a single byte is read or written
            if !context.policy.allows_source(peer_addr.ip()) {
                warn!("rejected client {}: source not allowed", peer_addr);
                drop(inbound);
                continue;
            }

            let context = Arc::clone(&context);

            tokio::spawn(async move {
                info!("new client: {}", peer_addr);

                let session = Session::new(inbound, peer_addr, context);
                if let Err(e) = session.run().await {
                    error!("connection error from {}: {:#}", peer_addr, e);
                }
            });
        }
    }
}

/// Session is one accepted connection. It owns the client stream for its
/// whole life and moves strictly through handshake, request and relay.
pub struct Session<S> {
    stream: S,
    peer_addr: SocketAddr,
    context: Arc<SessionContext>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer_addr: SocketAddr, context: Arc<SessionContext>) -> Self {
        Self {
            stream,
            peer_addr,
            context,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let timeouts = self.context.timeouts;
        let peer_addr = self.peer_addr;

        // Greeting, authentication and request share the handshake budget
        let request = tokio::time::timeout(timeouts.handshake, self.accept_request())
            .await
            .map_err(|_| anyhow!("handshake with {} timed out", peer_addr))??;

        // The connect is bounded on its own so a timeout still gets a reply
        let outbound = commands::dispatch(
            &mut self.stream,
            request,
            &self.context.policy,
            timeouts.connect,
        )
        .await?;

        Relay {
            inbound: self.stream,
            outbound,
            idle_timeout: timeouts.idle,
        }
        .run()
        .await
    }

    /// accept_request negotiates auth and reads the client's request
    async fn accept_request(&mut self) -> Result<Request> {
        let method =
            handshake::negotiate(&mut self.stream, self.context.credentials.as_ref()).await?;
        debug!("{} negotiated {:?}", self.peer_addr, method);

        let request = commands::read_request(&mut self.stream).await?;
        info!(
            "{} requested {:?} {}",
            self.peer_addr, request.command, request.target
        );

        Ok(request)
    }
}
