//! [`Transport`] over the system Bluetooth stack via `bluest`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bluest::{Adapter, AdvertisingDevice, Characteristic, ConnectionEvent, Device};
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::transport::{Connection, Transport};
use crate::core::bluetooth::types::{DisconnectCallback, ManufacturerData, RawAdvertisement};
use crate::error::TransportError;
use crate::utils::lock;

fn backend(e: bluest::Error) -> TransportError {
    TransportError::Backend(e.into())
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen while scanning, by id
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await.map_err(backend)?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn to_raw(discovered: &AdvertisingDevice) -> RawAdvertisement {
        let adv = &discovered.adv_data;
        RawAdvertisement {
            address: discovered.device.id().to_string(),
            local_name: adv
                .local_name
                .clone()
                .or_else(|| discovered.device.name().ok()),
            rssi: discovered.rssi,
            manufacturer_data: adv.manufacturer_data.as_ref().map(|m| ManufacturerData {
                company_id: m.company_id,
                data: m.data.to_vec(),
            }),
            services: adv.services.to_vec(),
            service_data: adv
                .service_data
                .iter()
                .map(|(uuid, data)| (*uuid, data.to_vec()))
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for BluestTransport {
    async fn scan(
        &self,
        services: &[Uuid],
    ) -> Result<BoxStream<'static, RawAdvertisement>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let services = services.to_vec();

        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(scan_stream) => scan_stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    return;
                }
            };
            info!("Starting bluetooth scan");

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        info!("Scan receiver dropped, stopping scan.");
                        break;
                    }
                    result = scan_stream.next() => match result {
                        Some(discovered) => {
                            debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                            let adv = Self::to_raw(&discovered);
                            lock(&devices).insert(adv.address.clone(), discovered.device);
                            if tx.send(adv).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let device = lock(&self.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", address);
            self.adapter
                .connect_device(&device)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let watch = CancellationToken::new();
        let watch_task = watch.clone();
        let adapter = self.adapter.clone();
        let watched = device.clone();
        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&watched).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch connection of {}: {}", watched.id(), e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = watch_task.cancelled() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            info!("Device {} disconnected", watched.id());
                            on_disconnect();
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });

        Ok(Arc::new(BluestConnection {
            address: address.to_string(),
            adapter: self.adapter.clone(),
            device,
            watch,
            characteristics: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }))
    }
}

struct BluestConnection {
    address: String,
    adapter: Adapter,
    device: Device,
    /// Stops the link-loss watcher
    watch: CancellationToken,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    subscriptions: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl BluestConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait::async_trait]
impl Connection for BluestConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn discover(&self, service: Uuid, characteristics: &[Uuid]) -> Result<(), TransportError> {
        let services = self.device.services().await.map_err(backend)?;
        let found = services
            .iter()
            .find(|s| s.uuid() == service)
            .ok_or_else(|| {
                for s in &services {
                    debug!("Available service: {}", s.uuid());
                }
                TransportError::ServiceNotFound(service)
            })?
            .clone();
        info!("Found service: {}", found.uuid());

        let available = found.characteristics().await.map_err(backend)?;
        let mut resolved = HashMap::new();
        for uuid in characteristics {
            let characteristic = available
                .iter()
                .find(|c| c.uuid() == *uuid)
                .ok_or(TransportError::CharacteristicNotFound(*uuid))?;
            debug!("Found characteristic: {}", uuid);
            resolved.insert(*uuid, characteristic.clone());
        }
        lock(&self.characteristics).extend(resolved);
        Ok(())
    }

    async fn write_without_response(
        &self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.characteristic(characteristic)?
            .write_without_response(data)
            .await
            .map_err(|e| TransportError::WriteFailed {
                characteristic,
                reason: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let target = self.characteristic(characteristic)?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            let mut notifications = match target.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel_task.cancelled() => break,
                    result = notifications.next() => match result {
                        Some(Ok(value)) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            info!("Notification stream ended");
        });

        let reason = match ready_rx.await {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some("notification task ended".to_string()),
        };
        if let Some(reason) = reason {
            return Err(TransportError::SubscribeFailed {
                characteristic,
                reason,
            });
        }

        lock(&self.subscriptions).insert(characteristic, cancel);
        Ok(receiver_stream(rx))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(cancel) = lock(&self.subscriptions).remove(&characteristic) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.watch.cancel();
        for (_, cancel) in lock(&self.subscriptions).drain() {
            cancel.cancel();
        }
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}
