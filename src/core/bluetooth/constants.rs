//! Constants used throughout the crate
//! UUIDs, advertisement layout sizes, and default timing values.

use uuid::Uuid;

/// Standard Device Information service; dice put their ID and build date in its service data
pub const UUID_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// The Pixels dice communication service (Nordic UART layout)
pub const UUID_PIXELS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic the die pushes messages on
pub const UUID_PIXELS_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic messages for the die are written to
pub const UUID_PIXELS_WRITE_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Company id dice advertise their manufacturer data under
pub const PIXELS_COMPANY_ID: u16 = 0xFFFF;

/// Manufacturer data: led count, design, roll state, face, battery
pub const ADV_MANUFACTURER_DATA_LEN: usize = 5;

/// Service data: pixel id, firmware build timestamp
pub const ADV_SERVICE_DATA_LEN: usize = 8;

/// Maximum number of connection attempts
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection attempts in milliseconds (immediate retry)
pub const CONNECT_RETRY_DELAY_MS: u64 = 0;

/// Time to wait for a correlated response in milliseconds
pub const COMMAND_TIMEOUT_MS: u64 = 10_000;
