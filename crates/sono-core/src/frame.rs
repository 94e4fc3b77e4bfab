//! Wire codec for the amplifier's command lines and 80-byte status frame.

use serde::Serialize;
use thiserror::Error;

/// Length of the binary status frame returned for `getSTATE`.
pub const FRAME_LEN: usize = 80;

/// Terminator closing every command line and acknowledgement.
pub const TERMINATOR: u8 = b'\r';

const FLAG_COUNT: usize = 7;
const RESERVED_BYTE: usize = 7;
const FLOAT_BASE: usize = 8;
const FLOAT_COUNT: usize = 18;

pub const CMD_GET_STATE: &str = "getSTATE";
pub const CMD_SET_VOLTAGE: &str = "setVOLT";
pub const CMD_SET_FREQUENCY: &str = "setFREQ";
pub const CMD_ENABLE: &str = "ENABLE";
pub const CMD_DISABLE: &str = "DISABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("status frame too short: got {got} bytes, need {FRAME_LEN}")]
    ShortFrame { got: usize },
    #[error("float field at offset {offset} overruns a {len}-byte buffer")]
    MalformedFloat { offset: usize, len: usize },
}

/// One decoded status report. Values are passed through as sent by the
/// device, including NaN and infinities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AmplifierState {
    pub enabled: bool,
    pub phase_tracking: bool,
    pub current_tracking: bool,
    pub power_tracking: bool,
    pub error_amp: bool,
    pub error_load: bool,
    pub error_temperature: bool,

    pub voltage: f32,
    pub frequency: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    pub phase_setpoint: f32,
    pub phase_control_gain: f32,
    pub current_setpoint: f32,
    pub current_control_gain: f32,
    pub power_setpoint: f32,
    pub power_control_gain: f32,
    pub max_load_power: f32,
    pub amplifier_power: f32,
    pub load_power: f32,
    pub temperature: f32,
    pub measured_phase: f32,
    pub measured_current: f32,
    pub impedance: f32,
    pub transformer_turns: f32,
}

impl AmplifierState {
    pub fn has_error(&self) -> bool {
        self.error_amp || self.error_load || self.error_temperature
    }

    fn flags(&self) -> [bool; FLAG_COUNT] {
        [
            self.enabled,
            self.phase_tracking,
            self.current_tracking,
            self.power_tracking,
            self.error_amp,
            self.error_load,
            self.error_temperature,
        ]
    }

    fn floats(&self) -> [f32; FLOAT_COUNT] {
        [
            self.voltage,
            self.frequency,
            self.min_frequency,
            self.max_frequency,
            self.phase_setpoint,
            self.phase_control_gain,
            self.current_setpoint,
            self.current_control_gain,
            self.power_setpoint,
            self.power_control_gain,
            self.max_load_power,
            self.amplifier_power,
            self.load_power,
            self.temperature,
            self.measured_phase,
            self.measured_current,
            self.impedance,
            self.transformer_turns,
        ]
    }

    /// Encode into the device's frame layout. Byte 7 is written as zero.
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        for (slot, flag) in frame.iter_mut().zip(self.flags()) {
            *slot = u8::from(flag);
        }
        for (i, value) in self.floats().into_iter().enumerate() {
            let offset = FLOAT_BASE + i * 4;
            frame[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        frame
    }
}

/// Build one command line: keyword, value text, carriage return.
pub fn encode_command(name: &str, value: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(name.len() + value.len() + 1);
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(value.as_bytes());
    line.push(TERMINATOR);
    line
}

/// Canonical text for a numeric setpoint. Whole numbers carry no fraction.
pub fn format_value(value: f32) -> String {
    format!("{value}")
}

fn read_f32(data: &[u8], offset: usize) -> Result<f32, FrameError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(FrameError::MalformedFloat {
            offset,
            len: data.len(),
        })?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode a status frame. Bytes past [`FRAME_LEN`] are ignored.
pub fn decode_state(data: &[u8]) -> Result<AmplifierState, FrameError> {
    if data.len() < FRAME_LEN {
        return Err(FrameError::ShortFrame { got: data.len() });
    }
    let flag = |i: usize| data[i] != 0;
    let _reserved = data[RESERVED_BYTE];
    let float = |i: usize| read_f32(data, FLOAT_BASE + i * 4);

    Ok(AmplifierState {
        enabled: flag(0),
        phase_tracking: flag(1),
        current_tracking: flag(2),
        power_tracking: flag(3),
        error_amp: flag(4),
        error_load: flag(5),
        error_temperature: flag(6),
        voltage: float(0)?,
        frequency: float(1)?,
        min_frequency: float(2)?,
        max_frequency: float(3)?,
        phase_setpoint: float(4)?,
        phase_control_gain: float(5)?,
        current_setpoint: float(6)?,
        current_control_gain: float(7)?,
        power_setpoint: float(8)?,
        power_control_gain: float(9)?,
        max_load_power: float(10)?,
        amplifier_power: float(11)?,
        load_power: float(12)?,
        temperature: float(13)?,
        measured_phase: float(14)?,
        measured_current: float(15)?,
        impedance: float(16)?,
        transformer_turns: float(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hand_built_frame() -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_LEN];
        frame[0] = 1; // enabled
        frame[5] = 1; // error_load
        frame[7] = 0xAA; // reserved, ignored
        let values: [f32; FLOAT_COUNT] = [
            25.0, 40_000.0, 20_000.0, 60_000.0, 0.5, 1.5, 0.2, 2.0, 10.0, 3.0, 50.0, 12.5,
            11.0, 36.6, -0.25, 0.75, 120.0, 8.0,
        ];
        for (i, v) in values.iter().enumerate() {
            let at = 8 + i * 4;
            frame[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        frame
    }

    #[test]
    fn decodes_hand_built_frame() {
        let state = decode_state(&hand_built_frame()).unwrap();
        assert!(state.enabled);
        assert!(!state.phase_tracking);
        assert!(state.error_load);
        assert!(state.has_error());
        assert_eq!(state.voltage, 25.0);
        assert_eq!(state.frequency, 40_000.0);
        assert_eq!(state.temperature, 36.6);
        assert_eq!(state.measured_phase, -0.25);
        assert_eq!(state.transformer_turns, 8.0);
    }

    #[test]
    fn reserved_byte_does_not_leak_into_encoding() {
        let state = decode_state(&hand_built_frame()).unwrap();
        let reencoded = state.to_frame();
        assert_eq!(reencoded[7], 0);
        assert_eq!(decode_state(&reencoded).unwrap(), state);
    }

    #[test]
    fn rejects_79_byte_frame() {
        let frame = hand_built_frame();
        assert_eq!(
            decode_state(&frame[..79]),
            Err(FrameError::ShortFrame { got: 79 })
        );
    }

    #[test]
    fn passes_non_finite_values_through() {
        let state = AmplifierState {
            voltage: f32::NAN,
            load_power: f32::INFINITY,
            ..Default::default()
        };
        let decoded = decode_state(&state.to_frame()).unwrap();
        assert!(decoded.voltage.is_nan());
        assert_eq!(decoded.load_power, f32::INFINITY);
    }

    #[test]
    fn float_read_past_end_is_malformed() {
        assert_eq!(
            read_f32(&[0u8; 10], 8),
            Err(FrameError::MalformedFloat { offset: 8, len: 10 })
        );
    }

    #[test]
    fn command_line_is_keyword_value_terminator() {
        assert_eq!(encode_command(CMD_SET_VOLTAGE, "75"), b"setVOLT75\r");
        assert_eq!(encode_command(CMD_DISABLE, ""), b"DISABLE\r");
        assert_eq!(format_value(10.0), "10");
        assert_eq!(format_value(12.5), "12.5");
    }
}

#[cfg(test)]
mod proptest_frame {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Property: any well-formed frame re-encodes to the same bytes
        #[test]
        fn frame_bytes_survive_decode(
            flags in prop::array::uniform7(any::<bool>()),
            body in prop::collection::vec(any::<u8>(), FRAME_LEN - FLOAT_BASE),
            reserved in any::<u8>(),
        ) {
            let mut frame = vec![0u8; FRAME_LEN];
            for (slot, flag) in frame.iter_mut().zip(flags) {
                *slot = u8::from(flag);
            }
            frame[RESERVED_BYTE] = reserved;
            frame[FLOAT_BASE..].copy_from_slice(&body);

            let state = decode_state(&frame).unwrap();
            let mut expected = frame.clone();
            expected[RESERVED_BYTE] = 0;
            prop_assert_eq!(state.to_frame().to_vec(), expected);
        }

        // Property: anything shorter than a frame is a short frame
        #[test]
        fn truncated_frames_are_rejected(len in 0usize..FRAME_LEN) {
            let data = vec![0u8; len];
            prop_assert_eq!(decode_state(&data), Err(FrameError::ShortFrame { got: len }));
        }
    }
}
