//! Binary encoding of [`Message`] frames.
//!
//! Decoding is strict about body length: fixed layouts must match exactly,
//! layouts ending in text must at least cover their fixed prefix.

use chrono::{DateTime, Utc};

use crate::core::protocol::messages::{
    BatteryLevel, Blink, BlinkId, IAmADie, Message, MessageKind, NotifyUser, RequestRssi,
    RollState, Telemetry, Temperature,
};
use crate::error::DecodeError;

/// Padding that precedes the telemetry fields (accelerometer frame, not decoded).
const TELEMETRY_PAD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Fixed(usize),
    /// Fixed prefix followed by UTF-8 text running to the end of the frame.
    Text(usize),
}

fn layout(kind: MessageKind) -> Layout {
    match kind {
        MessageKind::None
        | MessageKind::WhoAreYou
        | MessageKind::RequestRollState
        | MessageKind::BlinkAck
        | MessageKind::RequestBatteryLevel
        | MessageKind::Calibrate
        | MessageKind::SetNameAck
        | MessageKind::StopAllAnimations
        | MessageKind::RequestTemperature
        | MessageKind::BlinkIdAck => Layout::Fixed(0),
        MessageKind::IAmADie => Layout::Fixed(21),
        MessageKind::RollState | MessageKind::BatteryLevel | MessageKind::BlinkId => {
            Layout::Fixed(2)
        }
        MessageKind::Telemetry => Layout::Fixed(TELEMETRY_PAD + 12),
        MessageKind::Blink => Layout::Fixed(13),
        MessageKind::RequestRssi => Layout::Fixed(3),
        MessageKind::Rssi | MessageKind::CalibrateFace | MessageKind::NotifyUserAck => {
            Layout::Fixed(1)
        }
        MessageKind::Temperature => Layout::Fixed(4),
        MessageKind::NotifyUser => Layout::Text(3),
        MessageKind::DebugLog | MessageKind::SetName => Layout::Text(0),
    }
}

/// Cursor over a frame body whose length has already been validated.
struct Reader<'a> {
    kind: MessageKind,
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: MessageKind, body: &'a [u8]) -> Result<Self, DecodeError> {
        let ok = match layout(kind) {
            Layout::Fixed(len) => body.len() == len,
            Layout::Text(prefix) => body.len() >= prefix,
        };
        if !ok {
            let expected = match layout(kind) {
                Layout::Fixed(len) | Layout::Text(len) => len,
            };
            return Err(DecodeError::Length {
                kind,
                expected,
                got: body.len(),
            });
        }
        Ok(Self { kind, body, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.body[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn i8(&mut self) -> i8 {
        i8::from_le_bytes(self.take())
    }

    fn bool(&mut self) -> bool {
        self.u8() != 0
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn enumeration<T: TryFrom<u8, Error = DecodeError>>(&mut self) -> Result<T, DecodeError> {
        T::try_from(self.u8())
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        let rest = &self.body[self.pos..];
        self.pos = self.body.len();
        String::from_utf8(rest.to_vec()).map_err(|_| DecodeError::Utf8(self.kind))
    }
}

pub(crate) fn timestamp_from_secs(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

pub(crate) fn timestamp_to_secs(timestamp: &DateTime<Utc>) -> u32 {
    u32::try_from(timestamp.timestamp()).unwrap_or(0)
}

/// Decodes one frame received on the notify characteristic.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let (&id, body) = frame.split_first().ok_or(DecodeError::Empty)?;
    let kind = MessageKind::from_id(id).ok_or(DecodeError::UnknownMessage(id))?;
    let mut r = Reader::new(kind, body)?;

    let message = match kind {
        MessageKind::None => Message::None,
        MessageKind::WhoAreYou => Message::WhoAreYou,
        MessageKind::IAmADie => {
            let led_count = r.u8();
            let design_and_color = r.enumeration()?;
            r.skip(1);
            Message::IAmADie(IAmADie {
                led_count,
                design_and_color,
                data_set_hash: r.u32(),
                pixel_id: r.u32(),
                available_flash: r.u16(),
                build_timestamp: timestamp_from_secs(r.u32()),
                roll_state: r.enumeration()?,
                roll_face: r.u8(),
                batt_level: r.u8(),
                batt_state: r.enumeration()?,
            })
        }
        MessageKind::RollState => Message::RollState(RollState {
            state: r.enumeration()?,
            face: r.u8(),
        }),
        MessageKind::Telemetry => {
            r.skip(TELEMETRY_PAD);
            Message::Telemetry(Telemetry {
                battery_percent: r.u8(),
                battery_state: r.enumeration()?,
                voltage: r.u8(),
                v_coil: r.u8(),
                rssi: r.i8(),
                bt_channel: r.u8(),
                mcu_temp: r.i16(),
                battery_temp: r.i16(),
                internal_charge_state: r.u8(),
                force_disable_charging_state: r.u8(),
            })
        }
        MessageKind::DebugLog => Message::DebugLog(r.text()?),
        MessageKind::RequestRollState => Message::RequestRollState,
        MessageKind::Blink => Message::Blink(Blink {
            count: r.u8(),
            duration: r.u16(),
            color: r.u32(),
            face_mask: r.u32(),
            fade: r.u8(),
            looping: r.bool(),
        }),
        MessageKind::BlinkAck => Message::BlinkAck,
        MessageKind::RequestBatteryLevel => Message::RequestBatteryLevel,
        MessageKind::BatteryLevel => Message::BatteryLevel(BatteryLevel {
            level: r.u8(),
            state: r.enumeration()?,
        }),
        MessageKind::RequestRssi => Message::RequestRssi(RequestRssi {
            request_mode: r.enumeration()?,
            min_interval: r.u16(),
        }),
        MessageKind::Rssi => Message::Rssi(r.i8()),
        MessageKind::Calibrate => Message::Calibrate,
        MessageKind::CalibrateFace => Message::CalibrateFace(r.u8()),
        MessageKind::NotifyUser => Message::NotifyUser(NotifyUser {
            timeout: r.u8(),
            ok: r.bool(),
            cancel: r.bool(),
            text: r.text()?,
        }),
        MessageKind::NotifyUserAck => Message::NotifyUserAck(r.enumeration()?),
        MessageKind::SetName => Message::SetName(r.text()?),
        MessageKind::SetNameAck => Message::SetNameAck,
        MessageKind::StopAllAnimations => Message::StopAllAnimations,
        MessageKind::RequestTemperature => Message::RequestTemperature,
        MessageKind::Temperature => Message::Temperature(Temperature {
            mcu_temp: r.i16(),
            batt_temp: r.i16(),
        }),
        MessageKind::BlinkId => Message::BlinkId(BlinkId {
            brightness: r.u8(),
            looping: r.bool(),
        }),
        MessageKind::BlinkIdAck => Message::BlinkIdAck,
    };

    Ok(message)
}

/// Encodes a message as discriminant byte plus body, in decode's field order.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = vec![message.kind().id()];

    match message {
        Message::None
        | Message::WhoAreYou
        | Message::RequestRollState
        | Message::BlinkAck
        | Message::RequestBatteryLevel
        | Message::Calibrate
        | Message::SetNameAck
        | Message::StopAllAnimations
        | Message::RequestTemperature
        | Message::BlinkIdAck => {}
        Message::IAmADie(m) => {
            out.push(m.led_count);
            out.push(m.design_and_color.into());
            out.push(0);
            out.extend_from_slice(&m.data_set_hash.to_le_bytes());
            out.extend_from_slice(&m.pixel_id.to_le_bytes());
            out.extend_from_slice(&m.available_flash.to_le_bytes());
            out.extend_from_slice(&timestamp_to_secs(&m.build_timestamp).to_le_bytes());
            out.push(m.roll_state.into());
            out.push(m.roll_face);
            out.push(m.batt_level);
            out.push(m.batt_state.into());
        }
        Message::RollState(m) => {
            out.push(m.state.into());
            out.push(m.face);
        }
        Message::Telemetry(m) => {
            out.extend_from_slice(&[0u8; TELEMETRY_PAD]);
            out.push(m.battery_percent);
            out.push(m.battery_state.into());
            out.push(m.voltage);
            out.push(m.v_coil);
            out.extend_from_slice(&m.rssi.to_le_bytes());
            out.push(m.bt_channel);
            out.extend_from_slice(&m.mcu_temp.to_le_bytes());
            out.extend_from_slice(&m.battery_temp.to_le_bytes());
            out.push(m.internal_charge_state);
            out.push(m.force_disable_charging_state);
        }
        Message::DebugLog(text) | Message::SetName(text) => {
            out.extend_from_slice(text.as_bytes());
        }
        Message::Blink(m) => {
            out.push(m.count);
            out.extend_from_slice(&m.duration.to_le_bytes());
            out.extend_from_slice(&m.color.to_le_bytes());
            out.extend_from_slice(&m.face_mask.to_le_bytes());
            out.push(m.fade);
            out.push(u8::from(m.looping));
        }
        Message::BatteryLevel(m) => {
            out.push(m.level);
            out.push(m.state.into());
        }
        Message::RequestRssi(m) => {
            out.push(m.request_mode.into());
            out.extend_from_slice(&m.min_interval.to_le_bytes());
        }
        Message::Rssi(rssi) => out.extend_from_slice(&rssi.to_le_bytes()),
        Message::CalibrateFace(face) => out.push(*face),
        Message::NotifyUser(m) => {
            out.push(m.timeout);
            out.push(u8::from(m.ok));
            out.push(u8::from(m.cancel));
            out.extend_from_slice(m.text.as_bytes());
        }
        Message::NotifyUserAck(answer) => out.push((*answer).into()),
        Message::Temperature(m) => {
            out.extend_from_slice(&m.mcu_temp.to_le_bytes());
            out.extend_from_slice(&m.batt_temp.to_le_bytes());
        }
        Message::BlinkId(m) => {
            out.push(m.brightness);
            out.push(u8::from(m.looping));
        }
    }

    out
}
