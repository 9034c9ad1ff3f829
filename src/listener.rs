use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    config::Config,
    controller::{Signal, SHUTDOWN_BROADCAST},
    error::{ConnectionError, SessionError},
    hooks::Hooks,
    internal,
    session::Session,
};

/// Accepts clients and pairs each with a fresh upstream connection.
pub struct Listener {
    config: Arc<Config>,
    hooks: Hooks,
}

impl Listener {
    #[must_use]
    pub const fn new(config: Arc<Config>, hooks: Hooks) -> Self {
        Self { config, hooks }
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or accepting fails.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound socket until a shutdown signal arrives,
    /// then wait for the running sessions to end.
    ///
    /// # Errors
    ///
    /// Fails if accepting a connection fails.
    pub async fn serve_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        internal!(
            level = INFO,
            "Tunnel listening on {} for {}",
            local,
            self.config.upstream.address
        );

        let mut sessions: Vec<JoinHandle<()>> = Vec::default();
        let mut receiver = SHUTDOWN_BROADCAST.subscribe();

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "Listener {} received shutdown signal, finishing sessions ...", local);
                        join_all(sessions).await;
                        SHUTDOWN_BROADCAST.send(Signal::Finalised)?;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received from {peer}");

                    sessions.retain(|session| !session.is_finished());
                    sessions.push(tokio::spawn(handle(
                        stream,
                        peer,
                        Arc::clone(&self.config),
                        self.hooks.clone(),
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Connect upstream on behalf of one client and run the session.
async fn handle(mut client: TcpStream, peer: SocketAddr, config: Arc<Config>, hooks: Hooks) {
    let limit = config.timeouts.connect_timeout();
    let upstream = match timeout(limit, TcpStream::connect(&config.upstream.address)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            refuse(&mut client, peer, &config, ConnectionError::Io(err)).await;
            return;
        }
        Err(_) => {
            refuse(&mut client, peer, &config, ConnectionError::Timeout(limit.as_secs())).await;
            return;
        }
    };

    match Session::new(client, upstream, config, hooks)
        .with_peer(peer)
        .run()
        .await
    {
        Ok(()) | Err(SessionError::Client(_)) => {}
        Err(err) => tracing::debug!(%peer, "Session failed: {err}"),
    }
}

/// Turn the client away when the upstream cannot be reached.
async fn refuse(client: &mut TcpStream, peer: SocketAddr, config: &Config, err: ConnectionError) {
    tracing::warn!(%peer, "Unable to reach {}: {err}", config.upstream.address);

    let err = SessionError::Upstream(err);
    if let Some(reply) = err.final_reply() {
        let _ = client.write_all(format!("{reply}\r\n").as_bytes()).await;
    }
    let _ = client.shutdown().await;
}
