//! Message catalogue for the Pixels communication service.
//!
//! Every frame on the wire is one discriminant byte followed by a
//! kind-specific little-endian body. The numbering follows the die firmware.

use chrono::{DateTime, Utc};

use crate::error::DecodeError;

/// Declares a `u8`-backed wire enum with a checked `TryFrom<u8>`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $field:literal {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<u8> for $name {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(DecodeError::InvalidValue { field: $field, value }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

wire_enum! {
    /// The current motion of the die.
    RollStateKind as "roll_state" {
        Unknown = 0,
        /// Sitting flat and not moving
        OnFace = 1,
        /// In hand (detection is not very reliable)
        Handling = 2,
        /// Actively rolling
        Rolling = 3,
        /// Still, but not flat and level
        Crooked = 4,
    }
}

wire_enum! {
    /// Charge state of the battery as reported over the connection.
    BatteryState as "battery_state" {
        /// Discharging
        Ok = 0,
        /// Level is low, the user should recharge
        Low = 1,
        Charging = 2,
        /// Full and sitting on the cradle
        Done = 3,
        /// Tried to charge but something went wrong (coil voltage off from sitting crooked)
        BadCharging = 4,
        Error = 5,
    }
}

wire_enum! {
    /// Aesthetic design of the die.
    DesignAndColor as "design_and_color" {
        Unknown = 0,
        Generic = 1,
        V3Orange = 2,
        V4BlackClear = 3,
        V4WhiteClear = 4,
        V5Grey = 5,
        V5White = 6,
        V5Black = 7,
        V5Gold = 8,
        OnyxBlack = 9,
        HematiteGrey = 10,
        MidnightGalaxy = 11,
        AuroraSky = 12,
    }
}

wire_enum! {
    /// How often a piece of telemetry should be reported.
    RequestMode as "request_mode" {
        Off = 0,
        Once = 1,
        Repeat = 2,
    }
}

wire_enum! {
    /// Button chosen in reply to a [`NotifyUser`] prompt.
    OkCancel as "ok_cancel" {
        Cancel = 0,
        Ok = 1,
    }
}

/// The kind of die, derived from its LED count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DieFlavor {
    D4,
    D6,
    D6Pipped,
    D6Fudge,
    D8,
    D10,
    D12,
    D20,
}

impl DieFlavor {
    pub fn from_led_count(leds: u8) -> Option<Self> {
        match leds {
            4 => Some(Self::D4),
            6 => Some(Self::D6),
            8 => Some(Self::D8),
            10 => Some(Self::D10),
            12 => Some(Self::D12),
            20 => Some(Self::D20),
            21 => Some(Self::D6Pipped),
            _ => None,
        }
    }

    pub fn face_count(self) -> u8 {
        match self {
            Self::D4 => 4,
            Self::D6 | Self::D6Pipped | Self::D6Fudge => 6,
            Self::D8 => 8,
            Self::D10 => 10,
            Self::D12 => 12,
            Self::D20 => 20,
        }
    }
}

/// Discriminant byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    None = 0,
    WhoAreYou = 1,
    IAmADie = 2,
    RollState = 3,
    Telemetry = 4,
    DebugLog = 18,
    RequestRollState = 23,
    Blink = 29,
    BlinkAck = 30,
    RequestBatteryLevel = 33,
    BatteryLevel = 34,
    RequestRssi = 35,
    Rssi = 36,
    Calibrate = 37,
    CalibrateFace = 38,
    NotifyUser = 39,
    NotifyUserAck = 40,
    SetName = 51,
    SetNameAck = 52,
    StopAllAnimations = 59,
    RequestTemperature = 60,
    Temperature = 61,
    BlinkId = 65,
    BlinkIdAck = 66,
}

impl MessageKind {
    pub const ALL: [MessageKind; 24] = [
        Self::None,
        Self::WhoAreYou,
        Self::IAmADie,
        Self::RollState,
        Self::Telemetry,
        Self::DebugLog,
        Self::RequestRollState,
        Self::Blink,
        Self::BlinkAck,
        Self::RequestBatteryLevel,
        Self::BatteryLevel,
        Self::RequestRssi,
        Self::Rssi,
        Self::Calibrate,
        Self::CalibrateFace,
        Self::NotifyUser,
        Self::NotifyUserAck,
        Self::SetName,
        Self::SetNameAck,
        Self::StopAllAnimations,
        Self::RequestTemperature,
        Self::Temperature,
        Self::BlinkId,
        Self::BlinkIdAck,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.id() == id)
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// General information about the die. Reply to [`Message::WhoAreYou`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmADie {
    pub led_count: u8,
    pub design_and_color: DesignAndColor,
    pub data_set_hash: u32,
    /// Factory-assigned die ID
    pub pixel_id: u32,
    pub available_flash: u16,
    /// When the firmware was built
    pub build_timestamp: DateTime<Utc>,
    pub roll_state: RollStateKind,
    /// Upright face, starting at 0. Validity depends on `roll_state`.
    pub roll_face: u8,
    /// Battery level as a percent
    pub batt_level: u8,
    pub batt_state: BatteryState,
}

impl IAmADie {
    pub fn flavor(&self) -> Option<DieFlavor> {
        DieFlavor::from_led_count(self.led_count)
    }

    pub fn to_roll_state(&self) -> RollState {
        RollState {
            state: self.roll_state,
            face: self.roll_face,
        }
    }

    pub fn to_battery_level(&self) -> BatteryLevel {
        BatteryLevel {
            level: self.batt_level,
            state: self.batt_state,
        }
    }
}

/// Current motion. Broadcast on change and sent in reply to
/// [`Message::RequestRollState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollState {
    pub state: RollStateKind,
    /// Upright face, starting at 0
    pub face: u8,
}

/// Current battery. Broadcast on change and sent in reply to
/// [`Message::RequestBatteryLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel {
    /// Percent
    pub level: u8,
    pub state: BatteryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub battery_percent: u8,
    pub battery_state: BatteryState,
    /// Volts times 50
    pub voltage: u8,
    /// Volts times 50
    pub v_coil: u8,
    pub rssi: i8,
    pub bt_channel: u8,
    /// Centi-degrees Celsius
    pub mcu_temp: i16,
    /// Centi-degrees Celsius
    pub battery_temp: i16,
    pub internal_charge_state: u8,
    pub force_disable_charging_state: u8,
}

/// Ad-hoc blink animation. Acknowledged with [`Message::BlinkAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    pub count: u8,
    /// Total duration in milliseconds
    pub duration: u16,
    /// 0xRRGGBB
    pub color: u32,
    pub face_mask: u32,
    pub fade: u8,
    pub looping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRssi {
    pub request_mode: RequestMode,
    /// Interval between repeated reports, in milliseconds
    pub min_interval: u16,
}

impl Default for RequestRssi {
    /// A single report, no repeat.
    fn default() -> Self {
        Self {
            request_mode: RequestMode::Once,
            min_interval: 0,
        }
    }
}

/// The die is asking the user a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyUser {
    /// Seconds the die waits for an answer
    pub timeout: u8,
    pub ok: bool,
    pub cancel: bool,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temperature {
    pub mcu_temp: i16,
    pub batt_temp: i16,
}

impl Temperature {
    pub fn mcu_celsius(&self) -> f32 {
        f32::from(self.mcu_temp) / 100.0
    }

    pub fn battery_celsius(&self) -> f32 {
        f32::from(self.batt_temp) / 100.0
    }
}

/// Rainbow identification blink. Acknowledged with [`Message::BlinkIdAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkId {
    pub brightness: u8,
    pub looping: bool,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    None,
    WhoAreYou,
    IAmADie(IAmADie),
    RollState(RollState),
    Telemetry(Telemetry),
    DebugLog(String),
    RequestRollState,
    Blink(Blink),
    BlinkAck,
    RequestBatteryLevel,
    BatteryLevel(BatteryLevel),
    RequestRssi(RequestRssi),
    Rssi(i8),
    Calibrate,
    CalibrateFace(u8),
    NotifyUser(NotifyUser),
    NotifyUserAck(OkCancel),
    SetName(String),
    SetNameAck,
    StopAllAnimations,
    RequestTemperature,
    Temperature(Temperature),
    BlinkId(BlinkId),
    BlinkIdAck,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::None => MessageKind::None,
            Self::WhoAreYou => MessageKind::WhoAreYou,
            Self::IAmADie(_) => MessageKind::IAmADie,
            Self::RollState(_) => MessageKind::RollState,
            Self::Telemetry(_) => MessageKind::Telemetry,
            Self::DebugLog(_) => MessageKind::DebugLog,
            Self::RequestRollState => MessageKind::RequestRollState,
            Self::Blink(_) => MessageKind::Blink,
            Self::BlinkAck => MessageKind::BlinkAck,
            Self::RequestBatteryLevel => MessageKind::RequestBatteryLevel,
            Self::BatteryLevel(_) => MessageKind::BatteryLevel,
            Self::RequestRssi(_) => MessageKind::RequestRssi,
            Self::Rssi(_) => MessageKind::Rssi,
            Self::Calibrate => MessageKind::Calibrate,
            Self::CalibrateFace(_) => MessageKind::CalibrateFace,
            Self::NotifyUser(_) => MessageKind::NotifyUser,
            Self::NotifyUserAck(_) => MessageKind::NotifyUserAck,
            Self::SetName(_) => MessageKind::SetName,
            Self::SetNameAck => MessageKind::SetNameAck,
            Self::StopAllAnimations => MessageKind::StopAllAnimations,
            Self::RequestTemperature => MessageKind::RequestTemperature,
            Self::Temperature(_) => MessageKind::Temperature,
            Self::BlinkId(_) => MessageKind::BlinkId,
            Self::BlinkIdAck => MessageKind::BlinkIdAck,
        }
    }
}
