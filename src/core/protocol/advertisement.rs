//! Decoding of die advertisements into [`ScanResult`] records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::core::bluetooth::constants::{
    ADV_MANUFACTURER_DATA_LEN, ADV_SERVICE_DATA_LEN, PIXELS_COMPANY_ID, UUID_INFO_SERVICE,
    UUID_PIXELS_SERVICE,
};
use crate::core::bluetooth::types::{ManufacturerData, RawAdvertisement};
use crate::core::protocol::codec::{timestamp_from_secs, timestamp_to_secs};
use crate::core::protocol::messages::{
    BatteryLevel, BatteryState, DesignAndColor, DieFlavor, RollState, RollStateKind,
};
use crate::error::DecodeError;

const BATTERY_CHARGING_BIT: u8 = 0x80;
const BATTERY_LEVEL_MASK: u8 = 0x7f;

/// Immutable snapshot of one die advertisement.
///
/// A newer advertisement from the same die produces a new record; records are
/// never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Transport address (MAC on most platforms, an opaque id on macOS)
    pub address: String,
    pub name: String,
    /// Signal strength seen by the host when the advertisement was received
    pub rssi: Option<i16>,
    /// Number of LEDs, which also identifies the flavor
    pub led_count: u8,
    pub design_and_color: DesignAndColor,
    pub roll_state: RollStateKind,
    /// Upright face, starting at 0
    pub roll_face: u8,
    pub batt_charging: bool,
    /// Percent
    pub batt_level: u8,
    pub pixel_id: u32,
    pub build_timestamp: DateTime<Utc>,
}

impl ScanResult {
    /// Decodes an advertisement positionally.
    ///
    /// Returns [`DecodeError::NotADie`] when the manufacturer signature is
    /// missing and [`DecodeError::Incomplete`] for the short preliminary
    /// advertisements a die sends before its full payload.
    pub fn from_advertisement(adv: &RawAdvertisement) -> Result<Self, DecodeError> {
        let mdata = match &adv.manufacturer_data {
            Some(m) if m.company_id == PIXELS_COMPANY_ID => &m.data,
            _ => return Err(DecodeError::NotADie),
        };
        if mdata.len() < ADV_MANUFACTURER_DATA_LEN {
            return Err(DecodeError::Incomplete {
                expected: ADV_MANUFACTURER_DATA_LEN,
                got: mdata.len(),
            });
        }
        let sdata = adv
            .service_data
            .get(&UUID_INFO_SERVICE)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if sdata.len() < ADV_SERVICE_DATA_LEN {
            return Err(DecodeError::Incomplete {
                expected: ADV_SERVICE_DATA_LEN,
                got: sdata.len(),
            });
        }

        let batt = mdata[4];
        let pixel_id = u32::from_le_bytes([sdata[0], sdata[1], sdata[2], sdata[3]]);
        let build = u32::from_le_bytes([sdata[4], sdata[5], sdata[6], sdata[7]]);

        Ok(Self {
            address: adv.address.clone(),
            name: adv.local_name.clone().unwrap_or_default(),
            rssi: adv.rssi,
            led_count: mdata[0],
            design_and_color: DesignAndColor::try_from(mdata[1])?,
            roll_state: RollStateKind::try_from(mdata[2])?,
            roll_face: mdata[3],
            batt_charging: batt & BATTERY_CHARGING_BIT != 0,
            batt_level: batt & BATTERY_LEVEL_MASK,
            pixel_id,
            build_timestamp: timestamp_from_secs(build),
        })
    }

    pub fn flavor(&self) -> Option<DieFlavor> {
        DieFlavor::from_led_count(self.led_count)
    }

    pub fn face_count(&self) -> Option<u8> {
        self.flavor().map(DieFlavor::face_count)
    }

    pub fn to_roll_state(&self) -> RollState {
        RollState {
            state: self.roll_state,
            face: self.roll_face,
        }
    }

    /// The advertisement only carries a charging bit, so the state is either
    /// `Ok` or `Charging`.
    pub fn to_battery_level(&self) -> BatteryLevel {
        BatteryLevel {
            level: self.batt_level,
            state: if self.batt_charging {
                BatteryState::Charging
            } else {
                BatteryState::Ok
            },
        }
    }

    pub fn manufacturer_payload(&self) -> [u8; ADV_MANUFACTURER_DATA_LEN] {
        let mut batt = self.batt_level & BATTERY_LEVEL_MASK;
        if self.batt_charging {
            batt |= BATTERY_CHARGING_BIT;
        }
        [
            self.led_count,
            self.design_and_color.into(),
            self.roll_state.into(),
            self.roll_face,
            batt,
        ]
    }

    pub fn service_payload(&self) -> [u8; ADV_SERVICE_DATA_LEN] {
        let mut out = [0u8; ADV_SERVICE_DATA_LEN];
        out[..4].copy_from_slice(&self.pixel_id.to_le_bytes());
        out[4..].copy_from_slice(&timestamp_to_secs(&self.build_timestamp).to_le_bytes());
        out
    }

    /// Builds the advertisement a die with this state would broadcast.
    pub fn to_advertisement(&self) -> RawAdvertisement {
        RawAdvertisement {
            address: self.address.clone(),
            local_name: Some(self.name.clone()),
            rssi: self.rssi,
            manufacturer_data: Some(ManufacturerData {
                company_id: PIXELS_COMPANY_ID,
                data: self.manufacturer_payload().to_vec(),
            }),
            services: vec![UUID_INFO_SERVICE, UUID_PIXELS_SERVICE],
            service_data: HashMap::from([(UUID_INFO_SERVICE, self.service_payload().to_vec())]),
        }
    }
}

/// Decodes an advertisement, logging and skipping anything that is not a
/// complete die advertisement.
pub fn decode_advertisement(adv: &RawAdvertisement) -> Option<ScanResult> {
    match ScanResult::from_advertisement(adv) {
        Ok(sr) => Some(sr),
        Err(DecodeError::NotADie) => None,
        Err(e @ DecodeError::Incomplete { .. }) => {
            debug!("Skipping advertisement from {}: {}", adv.address, e);
            None
        }
        Err(e) => {
            warn!("Dropping malformed advertisement from {}: {}", adv.address, e);
            None
        }
    }
}
