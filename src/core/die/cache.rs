//! Last-known attribute values of a die.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::core::protocol::{
    BatteryState, DesignAndColor, DieFlavor, Message, RollStateKind, ScanResult,
};

/// A single cached attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Name,
    LedCount,
    DesignAndColor,
    PixelId,
    BuildTimestamp,
    RollState,
    RollFace,
    BattLevel,
    BattState,
    Rssi,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::LedCount => "led_count",
            Self::DesignAndColor => "design_and_color",
            Self::PixelId => "pixel_id",
            Self::BuildTimestamp => "build_timestamp",
            Self::RollState => "roll_state",
            Self::RollFace => "roll_face",
            Self::BattLevel => "batt_level",
            Self::BattState => "batt_state",
            Self::Rssi => "rssi",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the fields touched by one update.
pub type FieldSet = BTreeSet<Field>;

/// Cached die state. `None` means the field has not been observed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeCache {
    pub name: Option<String>,
    pub led_count: Option<u8>,
    pub design_and_color: Option<DesignAndColor>,
    pub pixel_id: Option<u32>,
    pub build_timestamp: Option<DateTime<Utc>>,
    pub roll_state: Option<RollStateKind>,
    /// Upright face, starting at 0
    pub roll_face: Option<u8>,
    /// Percent
    pub batt_level: Option<u8>,
    pub batt_state: Option<BatteryState>,
    /// Signal strength; seeded from the advertisement, then as reported by the die
    pub rssi: Option<i16>,
}

impl AttributeCache {
    pub fn from_scan(sr: &ScanResult) -> Self {
        let mut cache = Self::default();
        cache.seed(sr);
        cache
    }

    /// Overwrites every advertisement-sourced field.
    pub fn seed(&mut self, sr: &ScanResult) {
        let battery = sr.to_battery_level();
        self.name = Some(sr.name.clone());
        self.led_count = Some(sr.led_count);
        self.design_and_color = Some(sr.design_and_color);
        self.pixel_id = Some(sr.pixel_id);
        self.build_timestamp = Some(sr.build_timestamp);
        self.roll_state = Some(sr.roll_state);
        self.roll_face = Some(sr.roll_face);
        self.batt_level = Some(battery.level);
        self.batt_state = Some(battery.state);
        if sr.rssi.is_some() {
            self.rssi = sr.rssi;
        }
    }

    /// Applies a decoded message and returns the fields the message kind
    /// declares, or `None` if the kind carries no cached state.
    ///
    /// The set is the declared one even when a value did not change.
    pub fn apply(&mut self, message: &Message) -> Option<FieldSet> {
        let fields: &[Field] = match message {
            Message::RollState(rs) => {
                self.roll_state = Some(rs.state);
                self.roll_face = Some(rs.face);
                &[Field::RollState, Field::RollFace]
            }
            Message::BatteryLevel(bl) => {
                self.batt_level = Some(bl.level);
                self.batt_state = Some(bl.state);
                &[Field::BattLevel, Field::BattState]
            }
            Message::Rssi(rssi) => {
                self.rssi = Some(i16::from(*rssi));
                &[Field::Rssi]
            }
            Message::Telemetry(t) => {
                self.batt_level = Some(t.battery_percent);
                self.batt_state = Some(t.battery_state);
                self.rssi = Some(i16::from(t.rssi));
                &[Field::BattLevel, Field::BattState, Field::Rssi]
            }
            Message::IAmADie(iam) => {
                self.led_count = Some(iam.led_count);
                self.design_and_color = Some(iam.design_and_color);
                self.pixel_id = Some(iam.pixel_id);
                self.build_timestamp = Some(iam.build_timestamp);
                self.roll_state = Some(iam.roll_state);
                self.roll_face = Some(iam.roll_face);
                self.batt_level = Some(iam.batt_level);
                self.batt_state = Some(iam.batt_state);
                &[
                    Field::LedCount,
                    Field::DesignAndColor,
                    Field::PixelId,
                    Field::BuildTimestamp,
                    Field::RollState,
                    Field::RollFace,
                    Field::BattLevel,
                    Field::BattState,
                ]
            }
            _ => return None,
        };
        Some(fields.iter().copied().collect())
    }

    pub fn set_name(&mut self, name: &str) -> FieldSet {
        self.name = Some(name.to_string());
        FieldSet::from([Field::Name])
    }

    pub fn flavor(&self) -> Option<DieFlavor> {
        self.led_count.and_then(DieFlavor::from_led_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{BatteryLevel, RollState};
    use chrono::TimeZone;

    fn scan() -> ScanResult {
        ScanResult {
            address: "AA:BB".to_string(),
            name: "Francis".to_string(),
            rssi: Some(-70),
            led_count: 20,
            design_and_color: DesignAndColor::AuroraSky,
            roll_state: RollStateKind::OnFace,
            roll_face: 3,
            batt_charging: true,
            batt_level: 87,
            pixel_id: 42,
            build_timestamp: Utc.timestamp_opt(1_686_700_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_unknown_before_observation() {
        let cache = AttributeCache::default();
        assert_eq!(cache.roll_face, None);
        assert_eq!(cache.batt_level, None);
        assert_eq!(cache.flavor(), None);
    }

    #[test]
    fn test_seed_from_scan() {
        let cache = AttributeCache::from_scan(&scan());
        assert_eq!(cache.name.as_deref(), Some("Francis"));
        assert_eq!(cache.roll_face, Some(3));
        assert_eq!(cache.batt_level, Some(87));
        assert_eq!(cache.batt_state, Some(BatteryState::Charging));
        assert_eq!(cache.rssi, Some(-70));
        assert_eq!(cache.flavor(), Some(DieFlavor::D20));
    }

    #[test]
    fn test_apply_roll_state_touches_declared_fields() {
        let mut cache = AttributeCache::from_scan(&scan());
        let before = cache.clone();
        let changed = cache
            .apply(&Message::RollState(RollState {
                state: RollStateKind::Rolling,
                face: 3,
            }))
            .unwrap();
        assert_eq!(changed, FieldSet::from([Field::RollState, Field::RollFace]));
        assert_eq!(cache.roll_state, Some(RollStateKind::Rolling));
        assert_eq!(cache.roll_face, Some(3));
        assert_eq!(cache.batt_level, before.batt_level);
        assert_eq!(cache.name, before.name);
    }

    #[test]
    fn test_apply_battery_and_rssi() {
        let mut cache = AttributeCache::default();
        let changed = cache
            .apply(&Message::BatteryLevel(BatteryLevel {
                level: 12,
                state: BatteryState::Low,
            }))
            .unwrap();
        assert_eq!(changed, FieldSet::from([Field::BattLevel, Field::BattState]));
        assert_eq!(cache.apply(&Message::Rssi(-48)), Some(FieldSet::from([Field::Rssi])));
        assert_eq!(cache.rssi, Some(-48));
        assert_eq!(cache.roll_face, None);
    }

    #[test]
    fn test_apply_ignores_stateless_messages() {
        let mut cache = AttributeCache::from_scan(&scan());
        let before = cache.clone();
        assert_eq!(cache.apply(&Message::BlinkAck), None);
        assert_eq!(cache.apply(&Message::DebugLog("hi".into())), None);
        assert_eq!(cache, before);
    }

    #[test]
    fn test_field_names() {
        let names: Vec<_> = FieldSet::from([Field::RollFace, Field::RollState])
            .into_iter()
            .map(Field::as_str)
            .collect();
        assert_eq!(names, ["roll_state", "roll_face"]);
        assert_eq!(Field::BattLevel.to_string(), "batt_level");
    }
}
