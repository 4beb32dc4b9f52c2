//! In-memory [`Transport`] for tests and offline development.
//!
//! Dice are scripted up front: the advertisements they emit, the responses
//! they give to each request, and how many connection attempts fail first.
//! Tests can then push notifications or drop links at will.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, BoxStream, StreamExt};
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_PIXELS_NOTIFY_CHAR, UUID_PIXELS_SERVICE, UUID_PIXELS_WRITE_CHAR,
};
use crate::core::bluetooth::transport::{Connection, Transport};
use crate::core::bluetooth::types::{DisconnectCallback, RawAdvertisement};
use crate::core::protocol::{Message, MessageKind, ScanResult, encode};
use crate::error::TransportError;
use crate::utils::lock;

#[derive(Default)]
struct MockDie {
    responses: HashMap<MessageKind, Vec<Vec<u8>>>,
    failing_connects: u32,
    missing_service: bool,
    connect_attempts: u32,
    subscriptions: u32,
    connected: bool,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    on_disconnect: Option<DisconnectCallback>,
    writes: Vec<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    advertisements: Vec<RawAdvertisement>,
    dice: HashMap<String, MockDie>,
}

/// Scriptable transport. Clones share the same simulated radio.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a die that advertises `sr` and accepts connections.
    pub fn add_die(&self, sr: &ScanResult) {
        let mut state = lock(&self.state);
        state.advertisements.push(sr.to_advertisement());
        state.dice.entry(sr.address.clone()).or_default();
    }

    /// Adds an advertisement with no connectable device behind it.
    pub fn add_advertisement(&self, adv: RawAdvertisement) {
        lock(&self.state).advertisements.push(adv);
    }

    /// Makes the die answer every `request` with `response`.
    pub fn respond(&self, address: &str, request: MessageKind, response: &Message) {
        self.with_die(address, |die| {
            die.responses
                .entry(request)
                .or_default()
                .push(encode(response));
        });
    }

    /// Makes the die answer `request` with raw bytes.
    pub fn respond_raw(&self, address: &str, request: MessageKind, frame: Vec<u8>) {
        self.with_die(address, |die| {
            die.responses.entry(request).or_default().push(frame);
        });
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, address: &str, count: u32) {
        self.with_die(address, |die| die.failing_connects = count);
    }

    /// Service discovery will not find the Pixels service.
    pub fn remove_service(&self, address: &str) {
        self.with_die(address, |die| die.missing_service = true);
    }

    /// Pushes a notification frame. Returns false when nobody is subscribed.
    pub fn notify(&self, address: &str, frame: Vec<u8>) -> bool {
        let state = lock(&self.state);
        state
            .dice
            .get(address)
            .and_then(|die| die.notify_tx.as_ref())
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Simulates the die going out of range.
    pub fn drop_link(&self, address: &str) {
        let callback = {
            let mut state = lock(&self.state);
            let Some(die) = state.dice.get_mut(address) else {
                return;
            };
            die.connected = false;
            die.notify_tx = None;
            die.on_disconnect.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.read_die(address, |die| die.connect_attempts)
    }

    /// Subscriptions made over the die's lifetime.
    pub fn subscription_count(&self, address: &str) -> u32 {
        self.read_die(address, |die| die.subscriptions)
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.read_die(address, |die| die.notify_tx.is_some())
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.read_die(address, |die| die.connected)
    }

    /// Every frame written to the die, oldest first.
    pub fn writes(&self, address: &str) -> Vec<Vec<u8>> {
        self.read_die(address, |die| die.writes.clone())
    }

    fn with_die(&self, address: &str, f: impl FnOnce(&mut MockDie)) {
        let mut state = lock(&self.state);
        f(state.dice.entry(address.to_string()).or_default());
    }

    fn read_die<T: Default>(&self, address: &str, f: impl FnOnce(&MockDie) -> T) -> T {
        lock(&self.state).dice.get(address).map(f).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn scan(
        &self,
        services: &[Uuid],
    ) -> Result<BoxStream<'static, RawAdvertisement>, TransportError> {
        let services = services.to_vec();
        let advertisements: Vec<_> = lock(&self.state)
            .advertisements
            .iter()
            .filter(|adv| {
                services.is_empty() || adv.services.iter().any(|uuid| services.contains(uuid))
            })
            .cloned()
            .collect();
        Ok(stream::iter(advertisements).chain(stream::pending()).boxed())
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = lock(&self.state);
        let die = state
            .dice
            .get_mut(address)
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;
        die.connect_attempts += 1;
        if die.failing_connects > 0 {
            die.failing_connects -= 1;
            return Err(TransportError::ConnectFailed {
                address: address.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        die.connected = true;
        die.on_disconnect = Some(on_disconnect);
        debug!("Mock link to {} established", address);

        Ok(Arc::new(MockConnection {
            address: address.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    address: String,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn with_die<T>(
        &self,
        f: impl FnOnce(&mut MockDie) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = lock(&self.state);
        match state.dice.get_mut(&self.address) {
            Some(die) if die.connected => f(die),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover(
        &self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        self.with_die(|die| {
            if die.missing_service || service != UUID_PIXELS_SERVICE {
                return Err(TransportError::ServiceNotFound(service));
            }
            let known = [UUID_PIXELS_WRITE_CHAR, UUID_PIXELS_NOTIFY_CHAR];
            match characteristics.iter().find(|uuid| !known.contains(uuid)) {
                Some(missing) => Err(TransportError::CharacteristicNotFound(*missing)),
                None => Ok(()),
            }
        })
    }

    async fn write_without_response(
        &self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.with_die(|die| {
            if characteristic != UUID_PIXELS_WRITE_CHAR {
                return Err(TransportError::CharacteristicNotFound(characteristic));
            }
            die.writes.push(data.to_vec());
            let replies = data
                .first()
                .and_then(|id| MessageKind::from_id(*id))
                .and_then(|kind| die.responses.get(&kind))
                .cloned()
                .unwrap_or_default();
            if let Some(tx) = &die.notify_tx {
                for reply in replies {
                    let _ = tx.send(reply);
                }
            }
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let rx = self.with_die(|die| {
            if characteristic != UUID_PIXELS_NOTIFY_CHAR {
                return Err(TransportError::CharacteristicNotFound(characteristic));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            die.notify_tx = Some(tx);
            die.subscriptions += 1;
            Ok(rx)
        })?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) }).boxed())
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(die) = lock(&self.state).dice.get_mut(&self.address) {
            die.notify_tx = None;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(die) = lock(&self.state).dice.get_mut(&self.address) {
            die.connected = false;
            die.notify_tx = None;
            die.on_disconnect = None;
        }
        Ok(())
    }
}
