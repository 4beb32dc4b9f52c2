//! The wireless transport capability the die core is built on.
//!
//! Nothing outside this module's implementors talks to a radio; the
//! connection state machine only sees these traits.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::core::bluetooth::types::{DisconnectCallback, RawAdvertisement};
use crate::error::TransportError;

/// Scanning and connection establishment.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Starts a fresh, unbounded discovery stream filtered to `services`.
    /// Dropping the stream stops the scan.
    async fn scan(
        &self,
        services: &[Uuid],
    ) -> Result<BoxStream<'static, RawAdvertisement>, TransportError>;

    /// Connects to a previously discovered device. `on_disconnect` fires if the
    /// link later drops on its own; an explicit [`Connection::disconnect`]
    /// does not fire it.
    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An established link to one device.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> &str;

    /// Resolves `service` and each of `characteristics` inside it.
    async fn discover(&self, service: Uuid, characteristics: &[Uuid])
    -> Result<(), TransportError>;

    async fn write_without_response(
        &self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Yields raw notification payloads until unsubscribed or the link drops.
    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
