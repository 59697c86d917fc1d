//! The robot's vendor protocol.
//!
//! Commands are written to one GATT characteristic, answers arrive as notifications on
//! another. Every command is a short fixed frame with its checksum already baked in, so
//! they are sent verbatim. Answers are either short acknowledgements, which carry no
//! information, or 20 byte status frames (see [`StatusMessage`]).

use uuid::Uuid;

pub mod status_message;

pub use status_message::StatusMessage;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

const ACK_MARKER: [u8; 2] = [0x00, 0x51];
const ACK_SUFFIX: [u8; 2] = [0x51, 0x0c];
const ACK_SUFFIX_LONG: [u8; 3] = [0x51, 0x0c, 0xfd];
const ACK_MAX_LEN: usize = 12;

/// A command understood by the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PowerOn,
    PowerOff,
    QueryStatus,
}

impl Command {
    const POWER_ON: [u8; 7] = [0xff, 0xa5, 0x0a, 0x02, 0x01, 0x01, 0xb2];
    const POWER_OFF: [u8; 7] = [0xff, 0xa5, 0x0a, 0x02, 0x01, 0x00, 0xb1];
    // Answered with a status frame on the notify characteristic
    const QUERY_STATUS: [u8; 7] = [0xff, 0xa5, 0x0a, 0x02, 0x04, 0x06, 0xba];

    /// The verbatim bytes to write for this command
    pub fn payload(self) -> &'static [u8] {
        match self {
            Command::PowerOn => &Self::POWER_ON,
            Command::PowerOff => &Self::POWER_OFF,
            Command::QueryStatus => &Self::QUERY_STATUS,
        }
    }
}

/// Whether the frame is a transport level acknowledgement rather than a status report.
///
/// Two shapes are seen in practice: 3 or 4 bytes starting with `00 51`, and frames of at
/// most 12 bytes ending in `51 0c` or `51 0c fd`.
pub fn is_acknowledgement(frame: &[u8]) -> bool {
    if matches!(frame.len(), 3 | 4) && frame.starts_with(&ACK_MARKER) {
        return true;
    }
    frame.len() <= ACK_MAX_LEN && (frame.ends_with(&ACK_SUFFIX) || frame.ends_with(&ACK_SUFFIX_LONG))
}

/// What an inbound notification turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Status(StatusMessage),
    Unknown,
}

impl Frame {
    /// Acknowledgements are filtered before status parsing so they can never be mistaken
    /// for a status report.
    pub fn classify(frame: &[u8], in_water_bytes: std::ops::Range<usize>) -> Self {
        if is_acknowledgement(frame) {
            return Frame::Ack;
        }
        match StatusMessage::parse_with(frame, in_water_bytes) {
            Some(status) => Frame::Status(status),
            None => Frame::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_payloads_are_verbatim() {
        assert_eq!(hex::encode(Command::PowerOn.payload()), "ffa50a020101b2");
        assert_eq!(hex::encode(Command::PowerOff.payload()), "ffa50a020100b1");
        assert_eq!(hex::encode(Command::QueryStatus.payload()), "ffa50a020406ba");
    }

    #[test]
    fn short_frames_with_marker_are_acks() {
        for h in ["005101", "00510c0d", "ab510c", "0102030405510c", "0102510cfd"] {
            let frame = hex::decode(h).unwrap();
            assert!(is_acknowledgement(&frame), "{h} should be an ack");
        }
    }

    #[test]
    fn other_short_frames_are_not_acks() {
        for h in ["0051", "0051010203", "ff510d", "000102030405060708090a0b510c"] {
            let frame = hex::decode(h).unwrap();
            assert!(!is_acknowledgement(&frame), "{h} should not be an ack");
        }
    }

    #[test]
    fn status_frames_are_never_acks() {
        // Even a status frame ending in the ack suffix stays a status frame
        for h in [
            "ffa53a1384851e00000000000000000000000000",
            "ffa53a1384000000000000000000000000510cfd",
            "ffa53a1384800a00000000000000000000ff510c",
        ] {
            let frame = hex::decode(h).unwrap();
            assert!(!is_acknowledgement(&frame));
            assert!(matches!(Frame::classify(&frame, 16..20), Frame::Status(_)));
        }
    }

    #[test]
    fn classify_unknown() {
        let frame = hex::decode("deadbeefdeadbeefdeadbeefdeadbeef").unwrap();
        assert_eq!(Frame::classify(&frame, 16..20), Frame::Unknown);
        assert_eq!(Frame::classify(&hex::decode("005101").unwrap(), 16..20), Frame::Ack);
    }
}
