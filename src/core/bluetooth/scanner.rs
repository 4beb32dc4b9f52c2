use std::sync::Arc;

use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};

use crate::core::bluetooth::constants::UUID_PIXELS_SERVICE;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::RawAdvertisement;
use crate::core::protocol::{ScanResult, decode_advertisement};
use crate::error::Result;

/// Turns the transport's discovery stream into a stream of decoded dice.
#[derive(Clone)]
pub struct BluetoothScanner {
    transport: Arc<dyn Transport>,
    min_rssi: Option<i16>,
}

impl BluetoothScanner {
    pub fn new(transport: Arc<dyn Transport>, min_rssi: Option<i16>) -> Self {
        Self {
            transport,
            min_rssi,
        }
    }

    /// Starts a new scan. The stream never ends on its own; drop it to stop
    /// scanning. Every advertisement is reported, including repeats.
    pub async fn scan_for_dice(&self) -> Result<BoxStream<'static, ScanResult>> {
        info!("Starting scan for Pixels dice");
        let advertisements = self.transport.scan(&[UUID_PIXELS_SERVICE]).await?;
        let min_rssi = self.min_rssi;

        Ok(advertisements
            .filter_map(move |adv| future::ready(accept(&adv, min_rssi)))
            .boxed())
    }
}

fn accept(adv: &RawAdvertisement, min_rssi: Option<i16>) -> Option<ScanResult> {
    if let (Some(threshold), Some(rssi)) = (min_rssi, adv.rssi) {
        if rssi < threshold {
            debug!("Skipping {} with weak signal {} dBm", adv.address, rssi);
            return None;
        }
    }
    decode_advertisement(adv)
}
