use std::ops::Range;

/// Every status frame starts with these bytes
pub(crate) const HEADER: [u8; 5] = [0xff, 0xa5, 0x3a, 0x13, 0x84];

/// Length of a status frame in bytes
pub const FRAME_LEN: usize = 20;

/// Anything above this is a corrupt frame rather than a real countdown
pub const MAX_MINUTES: u16 = 300;

/// Bytes of the status frame which are non-zero while the robot is submerged
pub const DEFAULT_IN_WATER_BYTES: Range<usize> = 16..20;

/// The status reported by the robot in answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    /// Whether a cleaning cycle is running
    pub cleaning: bool,
    /// Minutes left in the running cycle, 0 when idle
    pub minutes_remaining: u16,
    /// Whether the robot reports being in the water
    pub in_water: bool,
}

impl StatusMessage {
    /// Parse a status frame using the default in-water byte range.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        Self::parse_with(frame, DEFAULT_IN_WATER_BYTES)
    }

    /// Attempt to parse a status frame.
    ///
    /// The frame format is:
    ///
    /// Start Byte | End Byte | Meaning
    /// 0          | 4        | A constant header with value [0xff, 0xa5, 0x3a, 0x13, 0x84]
    /// 5          | 5        | Bit 7 is set while cleaning
    /// 6          | 7        | Minutes remaining, little endian, only meaningful while cleaning
    /// 16         | 19       | Immersion indicator, any non-zero byte means in water
    ///
    /// Returns `None` for anything that is not a status frame. That is not an error: the
    /// firmware sends frames outside of this format and callers just skip them.
    pub fn parse_with(frame: &[u8], in_water_bytes: Range<usize>) -> Option<Self> {
        if frame.len() != FRAME_LEN || frame[..HEADER.len()] != HEADER {
            return None;
        }

        let cleaning = frame[5] & 0x80 != 0;
        let minutes = if cleaning {
            u16::from_le_bytes([frame[6], frame[7]])
        } else {
            0
        };
        let minutes_remaining = if minutes > MAX_MINUTES { 0 } else { minutes };
        let in_water = frame
            .get(in_water_bytes)
            .is_some_and(|bytes| bytes.iter().any(|&b| b != 0));

        Some(Self {
            cleaning,
            minutes_remaining,
            in_water,
        })
    }
}

#[test]
fn test_parse_cleaning_with_minutes() {
    let frame = hex::decode("ffa53a1384851e00000000000000000000000000").unwrap();
    let status = StatusMessage::parse(&frame).unwrap();
    assert_eq!(
        status,
        StatusMessage {
            cleaning: true,
            minutes_remaining: 30,
            in_water: false
        }
    );
}

#[test]
fn test_parse_idle_ignores_minutes_bytes() {
    let frame = hex::decode("ffa53a1384051e00000000000000000000000000").unwrap();
    let status = StatusMessage::parse(&frame).unwrap();
    assert!(!status.cleaning);
    assert_eq!(status.minutes_remaining, 0);
}

#[test]
fn test_parse_clamps_nonsense_minutes() {
    // 0x012d = 301
    let frame = hex::decode("ffa53a1384802d01000000000000000000000000").unwrap();
    let status = StatusMessage::parse(&frame).unwrap();
    assert!(status.cleaning);
    assert_eq!(status.minutes_remaining, 0);

    // 0x012c = 300 is still plausible
    let frame = hex::decode("ffa53a1384802c01000000000000000000000000").unwrap();
    assert_eq!(StatusMessage::parse(&frame).unwrap().minutes_remaining, 300);
}

#[test]
fn test_parse_in_water() {
    let frame = hex::decode("ffa53a1384851e00000000000000000000000100").unwrap();
    assert!(StatusMessage::parse(&frame).unwrap().in_water);

    // Same frame, but the byte lies outside a narrower configured range
    assert!(!StatusMessage::parse_with(&frame, 16..18).unwrap().in_water);
}

#[test]
fn test_parse_rejects_wrong_header_or_length() {
    let bad_header = hex::decode("ffa53a1385851e00000000000000000000000000").unwrap();
    assert_eq!(StatusMessage::parse(&bad_header), None);

    let short = hex::decode("ffa53a1384851e000000000000000000000000").unwrap();
    assert_eq!(StatusMessage::parse(&short), None);

    let long = hex::decode("ffa53a1384851e0000000000000000000000000000").unwrap();
    assert_eq!(StatusMessage::parse(&long), None);

    assert_eq!(StatusMessage::parse(&[]), None);
}

#[test]
fn test_parse_is_deterministic() {
    let frame = hex::decode("ffa53a138480ff00aa000000000000000001ff00").unwrap();
    let first = StatusMessage::parse(&frame);
    for _ in 0..8 {
        assert_eq!(StatusMessage::parse(&frame), first);
    }
    assert_eq!(first.unwrap().minutes_remaining, 255);
}
