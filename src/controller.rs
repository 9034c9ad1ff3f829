use std::sync::{Arc, LazyLock};

use tokio::sync::broadcast;

use crate::{config::Config, hooks::Hooks, internal, listener::Listener, logging};

pub struct Controller {
    config: Arc<Config>,
    hooks: Hooks,
}

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let _ = tokio::signal::ctrl_c().await;
    internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Controller {
    /// A controller using the built-in collaborators for `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hooks = Hooks::from_config(&config);
        Self {
            config: Arc::new(config),
            hooks,
        }
    }

    /// Replace the collaborators, e.g. to plug in a crypto backend.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run the tunnel until interrupted.
    ///
    /// # Errors
    ///
    /// This function will return an error if the listener cannot be bound.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        if self.config.rules.sign || self.config.rules.encrypt {
            tracing::warn!(
                "Signing or encryption is configured; messages fail those rules unless a crypto backend is installed"
            );
        }

        let listener = Listener::new(Arc::clone(&self.config), self.hooks);

        tokio::select! {
            result = listener.serve() => result?,
            result = shutdown() => result?,
        };

        internal!(level = INFO, "Shutting down...");

        Ok(())
    }
}
