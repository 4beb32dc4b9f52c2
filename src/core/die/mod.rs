//! The long-lived handle for one physical die.
//!
//! A [`Die`] outlives individual connections. Its link state, attribute cache
//! and pending-command table live behind one lock per die; applying a message
//! to the cache and firing the resulting events is additionally serialized so
//! two messages never interleave.

pub mod cache;
pub mod events;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::core::bluetooth::commands::CommandDispatcher;
use crate::core::bluetooth::connection::{ActiveLink, ConnectionManager};
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::LinkState;
use crate::core::protocol::{
    BatteryLevel, BatteryState, Blink, BlinkId, DesignAndColor, DieFlavor, IAmADie, Message,
    MessageKind, OkCancel, RequestRssi, RollState, RollStateKind, ScanResult, Temperature,
};
use crate::error::{PixelsError, Result};
use crate::utils::lock;

use cache::AttributeCache;
use events::{DieEvent, EventHub, EventKind, HandlerId};

pub(crate) struct DieState {
    pub(crate) link: LinkState,
    pub(crate) active: Option<ActiveLink>,
    pub(crate) cache: AttributeCache,
    /// Set by an explicit disconnect so the resulting link loss is not reported
    pub(crate) expected_disconnect: bool,
    pub(crate) auto_reconnect: bool,
    /// Bumped on every connection attempt; stale link-loss reports are ignored
    pub(crate) generation: u64,
}

pub(crate) struct DieShared {
    pub(crate) address: String,
    pub(crate) state: Mutex<DieState>,
    pub(crate) commands: CommandDispatcher,
    pub(crate) events: EventHub<Die, DieEvent>,
    pub(crate) connection_manager: ConnectionManager,
    /// Serializes connect, disconnect and link-loss handling
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    dispatch: Mutex<()>,
}

impl DieShared {
    pub(crate) fn link_state(&self) -> LinkState {
        lock(&self.state).link
    }

    pub(crate) fn set_link(&self, link: LinkState) {
        let mut state = lock(&self.state);
        if state.link != link {
            debug!("{}: {} -> {}", self.address, state.link, link);
            state.link = link;
        }
    }

    fn handle(self: &Arc<Self>) -> Die {
        Die {
            shared: self.clone(),
        }
    }

    /// Applies a decoded message to the cache, then fires its events.
    ///
    /// Notification-sourced fields are only written while the link is ready.
    pub(crate) fn publish(self: &Arc<Self>, message: &Message) {
        let _serial = lock(&self.dispatch);
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.link != LinkState::Ready {
                debug!("{}: dropping {:?} received while {}", self.address, message.kind(), state.link);
                return;
            }
            let previous = state.cache.roll_state;
            if let Some(changed) = state.cache.apply(message) {
                events.push(DieEvent::DataChanged(changed));
            }
            match message {
                Message::RollState(rs) => {
                    events.push(DieEvent::RollState(*rs));
                    let was_moving = matches!(
                        previous,
                        Some(RollStateKind::Rolling | RollStateKind::Handling)
                    );
                    if was_moving && rs.state == RollStateKind::OnFace {
                        events.push(DieEvent::Rolled { face: rs.face });
                    }
                }
                Message::BatteryLevel(bl) => events.push(DieEvent::BatteryLevel(*bl)),
                Message::NotifyUser(prompt) => events.push(DieEvent::NotifyUser(prompt.clone())),
                Message::DebugLog(text) => {
                    debug!("{} says: {}", self.address, text);
                    events.push(DieEvent::DebugLog(text.clone()));
                }
                _ => {}
            }
        }

        if events.is_empty() {
            return;
        }
        let die = self.handle();
        for event in &events {
            self.events.fire(&die, event);
        }
    }

    /// Records a name the die acknowledged. Skipped once the link is gone.
    fn commit_name(self: &Arc<Self>, name: &str) -> bool {
        let _serial = lock(&self.dispatch);
        let changed = {
            let mut state = lock(&self.state);
            if state.link != LinkState::Ready {
                debug!("{}: not recording name while {}", self.address, state.link);
                return false;
            }
            state.cache.set_name(name)
        };
        self.events.fire(&self.handle(), &DieEvent::DataChanged(changed));
        true
    }

    /// Fires a lifecycle event.
    pub(crate) fn emit(self: &Arc<Self>, event: DieEvent) {
        let _serial = lock(&self.dispatch);
        self.events.fire(&self.handle(), &event);
    }

    /// Takes a newer advertisement into the cache while no link owns it.
    fn refresh_from_scan(&self, sr: &ScanResult) {
        let mut state = lock(&self.state);
        if state.link.accepts_advertisements() {
            state.cache.seed(sr);
        }
    }
}

impl Drop for DieShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(active) = state.active.take() else {
            return;
        };
        active.cancel.cancel();
        self.commands.detach();
        let address = self.address.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = active.connection.disconnect().await {
                        warn!("Failed to disconnect dropped die {}: {}", address, e);
                    }
                });
            }
            Err(_) => warn!("Die {} dropped outside a runtime; link left open", address),
        }
    }
}

/// Handle for one physical die. Cheap to clone; clones share one connection
/// lifecycle, cache and set of handlers.
#[derive(Clone)]
pub struct Die {
    shared: Arc<DieShared>,
}

impl Die {
    pub(crate) fn new(sr: &ScanResult, transport: Arc<dyn Transport>, config: &LinkConfig) -> Self {
        let shared = DieShared {
            address: sr.address.clone(),
            state: Mutex::new(DieState {
                link: LinkState::Disconnected,
                active: None,
                cache: AttributeCache::from_scan(sr),
                expected_disconnect: false,
                auto_reconnect: false,
                generation: 0,
            }),
            commands: CommandDispatcher::new(config.command_timeout()),
            events: EventHub::new(),
            connection_manager: ConnectionManager::new(
                transport,
                config.max_connect_retries,
                config.connect_retry_delay(),
            ),
            lifecycle: tokio::sync::Mutex::new(()),
            dispatch: Mutex::new(()),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub(crate) fn from_weak(weak: &Weak<DieShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub(crate) fn downgrade(&self) -> Weak<DieShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn refresh_from_scan(&self, sr: &ScanResult) {
        self.shared.refresh_from_scan(sr);
    }

    /// The MAC address (an opaque id on macOS) of the die.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// True when both handles drive the same die.
    pub fn same_die(&self, other: &Die) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    /// Snapshot of every cached attribute.
    pub fn attributes(&self) -> AttributeCache {
        lock(&self.shared.state).cache.clone()
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.shared.state).cache.name.clone()
    }

    pub fn led_count(&self) -> Option<u8> {
        lock(&self.shared.state).cache.led_count
    }

    pub fn flavor(&self) -> Option<DieFlavor> {
        lock(&self.shared.state).cache.flavor()
    }

    pub fn design_and_color(&self) -> Option<DesignAndColor> {
        lock(&self.shared.state).cache.design_and_color
    }

    pub fn pixel_id(&self) -> Option<u32> {
        lock(&self.shared.state).cache.pixel_id
    }

    pub fn build_timestamp(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.state).cache.build_timestamp
    }

    pub fn roll_state(&self) -> Option<RollStateKind> {
        lock(&self.shared.state).cache.roll_state
    }

    /// Upright face, starting at 0. Validity depends on [`Die::roll_state`].
    pub fn roll_face(&self) -> Option<u8> {
        lock(&self.shared.state).cache.roll_face
    }

    pub fn batt_level(&self) -> Option<u8> {
        lock(&self.shared.state).cache.batt_level
    }

    pub fn batt_state(&self) -> Option<BatteryState> {
        lock(&self.shared.state).cache.batt_state
    }

    pub fn rssi(&self) -> Option<i16> {
        lock(&self.shared.state).cache.rssi
    }

    /// Registers `handler` for events of `kind`. Handlers run in registration
    /// order and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Die, &DieEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(kind, handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Connects once. Already-connected dice return immediately.
    pub async fn connect(&self) -> Result<()> {
        let _op = self.shared.lifecycle.lock().await;
        lock(&self.shared.state).expected_disconnect = false;
        self.shared
            .connection_manager
            .try_connect(&self.shared)
            .await
    }

    /// Connects with bounded retries and keeps reconnecting the same way when
    /// the link drops unexpectedly, until [`Die::disconnect`] is called.
    ///
    /// This is naive: retries are immediate by default and may all fail; a
    /// final failure after a drop is reported as [`DieEvent::ReconnectFailed`].
    pub async fn connect_with_reconnect(&self) -> Result<()> {
        let _op = self.shared.lifecycle.lock().await;
        {
            let mut state = lock(&self.shared.state);
            state.expected_disconnect = false;
            state.auto_reconnect = true;
        }
        let result = self
            .shared
            .connection_manager
            .connect_with_retry(&self.shared)
            .await;
        if result.is_err() {
            lock(&self.shared.state).auto_reconnect = false;
        }
        result
    }

    /// Tears the link down and fails every pending command with
    /// [`PixelsError::Disconnected`].
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.shared.lifecycle.lock().await;
        self.shared
            .connection_manager
            .disconnect(&self.shared)
            .await
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_commands(&self) -> usize {
        self.shared.commands.pending_count()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PixelsError::NotConnected)
        }
    }

    /// Sends a message the die does not acknowledge.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.ensure_ready()?;
        self.shared.commands.send(&message).await
    }

    /// Sends `request` and waits for the next message of kind `response`.
    /// State the response carries is already in the cache when this returns.
    ///
    /// Fails with [`PixelsError::Timeout`] after the configured command
    /// timeout, or [`PixelsError::Disconnected`] if the link goes away first.
    pub async fn send_and_wait(&self, request: Message, response: MessageKind) -> Result<Message> {
        self.ensure_ready()?;
        self.shared.commands.send_and_wait(&request, response).await
    }

    /// Performs a basic info query and refreshes the whole cache.
    pub async fn who_are_you(&self) -> Result<IAmADie> {
        match self.send_and_wait(Message::WhoAreYou, MessageKind::IAmADie).await? {
            Message::IAmADie(iam) => Ok(iam),
            other => Err(unexpected(MessageKind::IAmADie, &other)),
        }
    }

    pub async fn get_roll_state(&self) -> Result<RollState> {
        match self
            .send_and_wait(Message::RequestRollState, MessageKind::RollState)
            .await?
        {
            Message::RollState(rs) => Ok(rs),
            other => Err(unexpected(MessageKind::RollState, &other)),
        }
    }

    pub async fn get_battery_level(&self) -> Result<BatteryLevel> {
        match self
            .send_and_wait(Message::RequestBatteryLevel, MessageKind::BatteryLevel)
            .await?
        {
            Message::BatteryLevel(bl) => Ok(bl),
            other => Err(unexpected(MessageKind::BatteryLevel, &other)),
        }
    }

    /// Requests the RSSI as seen by the die.
    pub async fn get_rssi(&self) -> Result<i8> {
        let request = Message::RequestRssi(RequestRssi::default());
        match self.send_and_wait(request, MessageKind::Rssi).await? {
            Message::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(MessageKind::Rssi, &other)),
        }
    }

    /// Microcontroller and battery temperatures.
    pub async fn get_temperature(&self) -> Result<Temperature> {
        match self
            .send_and_wait(Message::RequestTemperature, MessageKind::Temperature)
            .await?
        {
            Message::Temperature(t) => Ok(t),
            other => Err(unexpected(MessageKind::Temperature, &other)),
        }
    }

    /// Runs an ad-hoc blink. Returns once the die acknowledges, not when the
    /// animation finishes.
    pub async fn blink(&self, blink: Blink) -> Result<()> {
        self.send_and_wait(Message::Blink(blink), MessageKind::BlinkAck)
            .await
            .map(|_| ())
    }

    /// Blinks a rainbow for identification. `brightness` 0 is off, 255 max.
    pub async fn blink_id(&self, brightness: u8, looping: bool) -> Result<()> {
        let request = Message::BlinkId(BlinkId {
            brightness,
            looping,
        });
        self.send_and_wait(request, MessageKind::BlinkIdAck)
            .await
            .map(|_| ())
    }

    pub async fn stop_all_animations(&self) -> Result<()> {
        self.send(Message::StopAllAnimations).await
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.send_and_wait(Message::SetName(name.to_string()), MessageKind::SetNameAck)
            .await?;
        info!("Renamed {} to {:?}", self.address(), name);
        if !self.shared.commit_name(name) {
            warn!("Link to {} dropped before the new name was recorded", self.address());
        }
        Ok(())
    }

    /// Starts calibration. Interaction continues through
    /// [`EventKind::NotifyUser`] events.
    pub async fn start_calibration(&self) -> Result<()> {
        self.send(Message::Calibrate).await
    }

    /// Calibrates `face`; the die must rest flat with that face up.
    pub async fn calibrate_face(&self, face: u8) -> Result<()> {
        self.send(Message::CalibrateFace(face)).await
    }

    /// Answers the prompt of the last [`DieEvent::NotifyUser`].
    pub async fn respond_to_notify_user(&self, answer: OkCancel) -> Result<()> {
        self.send(Message::NotifyUserAck(answer)).await
    }
}

fn unexpected(expected: MessageKind, got: &Message) -> PixelsError {
    PixelsError::UnexpectedResponse {
        expected,
        got: got.kind(),
    }
}

impl fmt::Debug for Die {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Die")
            .field("address", &self.shared.address)
            .field("name", &self.name())
            .field("link", &self.link_state())
            .finish_non_exhaustive()
    }
}
