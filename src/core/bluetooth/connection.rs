//! Connection lifecycle for a die
//! This module connects, discovers, subscribes, tears down and reconnects

use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::LinkCommandSender;
use crate::core::bluetooth::constants::{
    UUID_PIXELS_NOTIFY_CHAR, UUID_PIXELS_SERVICE, UUID_PIXELS_WRITE_CHAR,
};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::transport::{Connection, Transport};
use crate::core::bluetooth::types::{DisconnectCallback, LinkState};
use crate::core::die::DieShared;
use crate::core::die::events::DieEvent;
use crate::error::{PixelsError, Result};
use crate::utils::lock;

/// The live parts of a ready link
pub(crate) struct ActiveLink {
    pub(crate) connection: Arc<dyn Connection>,
    /// Stops the notification pump
    pub(crate) cancel: CancellationToken,
}

/// Connection manager for one die
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            max_retries,
            retry_delay,
        }
    }

    /// Connect with the retry policy. At least one attempt is always made.
    pub(crate) async fn connect_with_retry(&self, die: &Arc<DieShared>) -> Result<()> {
        let attempts = self.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_connect(die).await {
                Ok(()) => {
                    info!("Successfully connected to {} (attempt {})", die.address, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, die.address, e);
                    last_error = Some(e);

                    if attempt < attempts && !self.retry_delay.is_zero() {
                        info!("Retrying connection in {:?}...", self.retry_delay);
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PixelsError::NotConnected))
    }

    /// One connection attempt. On any failure the link is torn down and the
    /// die is back in `Disconnected`.
    pub(crate) async fn try_connect(&self, die: &Arc<DieShared>) -> Result<()> {
        let generation = {
            let mut state = lock(&die.state);
            if state.link == LinkState::Ready {
                debug!("{} already connected", die.address);
                return Ok(());
            }
            state.link = LinkState::Connecting;
            state.generation += 1;
            state.generation
        };

        info!("Initiating connection to {}...", die.address);
        let weak = Arc::downgrade(die);
        let on_disconnect: DisconnectCallback =
            Arc::new(move || spawn_link_lost(weak.clone(), generation));
        let connection = match self.transport.connect(&die.address, on_disconnect).await {
            Ok(connection) => connection,
            Err(e) => {
                die.set_link(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        die.set_link(LinkState::Discovering);
        info!("Connection successful, discovering services...");
        let notifications = match Self::subscribe(&connection).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Setup of {} failed: {}", die.address, e);
                if let Err(e) = connection.disconnect().await {
                    debug!("Teardown of {} after failed setup: {}", die.address, e);
                }
                die.set_link(LinkState::Disconnected);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        die.commands
            .attach(Arc::new(LinkCommandSender::new(connection.clone())));
        {
            let mut state = lock(&die.state);
            state.link = LinkState::Ready;
            state.active = Some(ActiveLink {
                connection,
                cancel: cancel.clone(),
            });
        }
        NotificationHandler::setup_notifications(
            Arc::downgrade(die),
            notifications,
            cancel,
            generation,
        );

        info!("Connection and setup of {} completed successfully", die.address);
        die.emit(DieEvent::Connected);
        Ok(())
    }

    async fn subscribe(connection: &Arc<dyn Connection>) -> Result<BoxStream<'static, Vec<u8>>> {
        connection
            .discover(
                UUID_PIXELS_SERVICE,
                &[UUID_PIXELS_WRITE_CHAR, UUID_PIXELS_NOTIFY_CHAR],
            )
            .await?;

        info!("Setting up notifications...");
        Ok(connection.subscribe(UUID_PIXELS_NOTIFY_CHAR).await?)
    }

    /// Explicit disconnect. Pending commands fail with `Disconnected` and
    /// automatic reconnection stops.
    pub(crate) async fn disconnect(&self, die: &Arc<DieShared>) -> Result<()> {
        let active = {
            let mut state = lock(&die.state);
            state.expected_disconnect = true;
            state.auto_reconnect = false;
            if state.link == LinkState::Disconnected {
                info!("Die {} not connected", die.address);
                return Ok(());
            }
            state.link = LinkState::Disconnecting;
            state.active.take()
        };

        let failed = die.commands.detach();
        if failed > 0 {
            info!("Failed {} pending command(s) on {}", failed, die.address);
        }

        let mut result = Ok(());
        if let Some(active) = active {
            info!("Disconnecting from die {}", die.address);
            active.cancel.cancel();
            if let Err(e) = active.connection.unsubscribe(UUID_PIXELS_NOTIFY_CHAR).await {
                warn!("Failed to unsubscribe from {}: {}", die.address, e);
            }
            result = active.connection.disconnect().await;
        }
        die.set_link(LinkState::Disconnected);

        match result {
            Ok(()) => {
                info!("Successfully disconnected");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reacts to a link that dropped without being asked to.
    ///
    /// Reports from an older connection attempt, or for a link that is no
    /// longer ready, are ignored.
    pub(crate) async fn handle_link_lost(&self, die: &Arc<DieShared>, generation: u64) {
        let _op = die.lifecycle.lock().await;

        let (active, reconnect) = {
            let mut state = lock(&die.state);
            if state.generation != generation || state.link != LinkState::Ready {
                debug!("Ignoring stale link loss for {}", die.address);
                return;
            }
            state.link = LinkState::Disconnected;
            (
                state.active.take(),
                state.auto_reconnect && !state.expected_disconnect,
            )
        };

        warn!("Lost connection to {}", die.address);
        die.commands.detach();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(e) = active.connection.disconnect().await {
                debug!("Releasing dropped link to {}: {}", die.address, e);
            }
        }
        die.emit(DieEvent::Disconnected);

        if !reconnect {
            return;
        }

        info!("Attempting to reconnect to {}", die.address);
        if let Err(e) = self.connect_with_retry(die).await {
            error!("Giving up reconnecting to {}: {}", die.address, e);
            lock(&die.state).auto_reconnect = false;
            die.emit(DieEvent::ReconnectFailed(e.to_string()));
        }
    }
}

/// Hands a link-loss report to the runtime. Called from transport callbacks
/// and from the notification pump, neither of which may block.
pub(crate) fn spawn_link_lost(die: Weak<DieShared>, generation: u64) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("Link loss reported outside a runtime; ignored");
        return;
    };
    runtime.spawn(async move {
        if let Some(die) = die.upgrade() {
            let manager = die.connection_manager.clone();
            manager.handle_link_lost(&die, generation).await;
        }
    });
}
