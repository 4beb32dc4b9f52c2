//! Entry point for scanning and obtaining die handles
//! This module owns the transport and hands out one `Die` per address

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_util::stream::BoxStream;
use log::{debug, info};

use crate::config::LinkConfig;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::transport::Transport;
use crate::core::die::{Die, DieShared};
use crate::core::protocol::ScanResult;
use crate::error::Result;
use crate::utils::lock;

/// Scans for dice and keeps at most one live [`Die`] per address
pub struct DiceManager {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    scanner: BluetoothScanner,
    /// Weak so dropping every handle releases the die
    dice: Mutex<HashMap<String, Weak<DieShared>>>,
}

impl DiceManager {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        let scanner = BluetoothScanner::new(transport.clone(), config.min_rssi);
        Self {
            transport,
            config,
            scanner,
            dice: Mutex::new(HashMap::new()),
        }
    }

    /// Uses the system's default Bluetooth adapter.
    #[cfg(feature = "bluest")]
    pub async fn with_default_adapter(config: LinkConfig) -> Result<Self> {
        let transport = crate::core::bluetooth::bluest_transport::BluestTransport::new().await?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// See [`BluetoothScanner::scan_for_dice`].
    pub async fn scan_for_dice(&self) -> Result<BoxStream<'static, ScanResult>> {
        self.scanner.scan_for_dice().await
    }

    /// Returns the handle for the die behind `sr`, creating it on first use.
    ///
    /// Hydrating the same address again yields the same die. Its cache only
    /// takes the newer advertisement while no link owns it.
    pub fn hydrate(&self, sr: &ScanResult) -> Die {
        let mut dice = lock(&self.dice);
        dice.retain(|_, die| die.strong_count() > 0);

        if let Some(die) = dice.get(&sr.address).and_then(Die::from_weak) {
            debug!("Refreshing known die {}", sr.address);
            die.refresh_from_scan(sr);
            return die;
        }

        info!("New die {} ({:?})", sr.address, sr.name);
        let die = Die::new(sr, self.transport.clone(), &self.config);
        dice.insert(sr.address.clone(), die.downgrade());
        die
    }

    /// Handles to every die that is still alive.
    pub fn known_dice(&self) -> Vec<Die> {
        lock(&self.dice).values().filter_map(Die::from_weak).collect()
    }
}
