use byteorder::{BE, ByteOrder, WriteBytesExt};
use log::warn;
use num_enum::TryFromPrimitive;
use std::fmt::Display;
use thiserror::Error;

// Every frame, in both directions, starts with this header:
//
//   0..2   magic 0x12 0x34
//   2..4   command id, u16
//   4..8   sequence number, u32
//   8..12  length word: low 24 bits payload length, high 8 bits padding count
//
// followed by the payload and then `padding` filler bytes. The host never pads; the device
// sometimes rounds its frames up, and the filler has to be skipped on receive.
pub const HEADER_SIZE: usize = 12;
pub const MAGIC: [u8; 2] = [0x12, 0x34];

/// Largest payload in either direction. Anything bigger is treated as line noise on receive
/// and refused on send.
pub const MAX_PAYLOAD: usize = 1 << 20;

const LENGTH_MASK: u32 = 0x00ff_ffff;

/// Operations understood by the device firmware. Values are fixed by the device.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names as used by the device firmware
pub enum CommandId {
    INVALID = 0,
    GET_DEVICE_INFO = 1,
    GET_DEVICE_TIME = 2,
    SET_DEVICE_TIME = 3,
    GET_FILE_LIST = 4,
    TRANSFER_FILE = 5,
    GET_FILE_COUNT = 6,
    DELETE_FILE = 7,
    REQUEST_FIRMWARE_UPGRADE = 8,
    FIRMWARE_UPLOAD = 9,
    DEVICE_MSG_TEST = 10,
    GET_SETTINGS = 11,
    SET_SETTINGS = 12,
    GET_FILE_BLOCK = 13,
    GET_CARD_INFO = 16,
    FORMAT_CARD = 17,
    GET_RECORDING_FILE = 18,
    RESTORE_FACTORY_SETTINGS = 19,
    SEND_MEETING_SCHEDULE_INFO = 20,
    READ_FILE_PART = 21,
    REQUEST_TONE_UPDATE = 22,
    UPDATE_TONE = 23,
    REQUEST_UAC_UPDATE = 24,
    UPDATE_UAC = 25,
    REALTIME_READ_SETTING = 32,
    REALTIME_CONTROL = 33,
    REALTIME_TRANSFER = 34,
    BLUETOOTH_SCAN = 4097,
    BLUETOOTH_CMD = 4098,
    BLUETOOTH_STATUS = 4099,
    // Factory/test range. Regular commands never use values from here up.
    TEST_SN_WRITE = 61447,
    RECORD_TEST_START = 61448,
    RECORD_TEST_END = 61449,
    FACTORY_RESET = 61451,
}

impl CommandId {
    /// First value of the reserved factory command range.
    pub const ADVANCED_RANGE_START: u16 = 61447;

    pub fn is_advanced(self) -> bool {
        self as u16 >= Self::ADVANCED_RANGE_START
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}({})", *self as u16)
    }
}

/// Command field of a received frame. The device may answer with ids this crate does not know
/// about; those are carried opaquely instead of being rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandCode {
    Known(CommandId),
    Unknown(u16),
}

impl CommandCode {
    pub fn raw(self) -> u16 {
        match self {
            CommandCode::Known(id) => id as u16,
            CommandCode::Unknown(raw) => raw,
        }
    }

    pub fn known(self) -> Option<CommandId> {
        match self {
            CommandCode::Known(id) => Some(id),
            CommandCode::Unknown(_) => None,
        }
    }
}

impl From<CommandId> for CommandCode {
    fn from(id: CommandId) -> Self {
        CommandCode::Known(id)
    }
}

impl From<u16> for CommandCode {
    fn from(raw: u16) -> Self {
        match CommandId::try_from(raw) {
            Ok(id) => CommandCode::Known(id),
            Err(_) => CommandCode::Unknown(raw),
        }
    }
}

impl Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommandCode::Known(id) => write!(f, "{id}"),
            CommandCode::Unknown(raw) => write!(f, "UNKNOWN({raw})"),
        }
    }
}

/// One complete protocol message. The payload length on the wire is always `payload.len()`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: CommandCode,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<CommandCode>, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            sequence,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize header and payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(EncodeError::Oversized {
                actual: self.payload.len(),
            });
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC);
        // Writes into a Vec cannot fail.
        out.write_u16::<BE>(self.command.raw()).unwrap();
        out.write_u32::<BE>(self.sequence).unwrap();
        out.write_u32::<BE>(self.payload.len() as u32).unwrap();
        debug_assert_eq!(out.len(), HEADER_SIZE);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Encode an outgoing command frame.
pub fn encode(
    command: CommandId,
    sequence: u32,
    payload: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    Frame::new(command, sequence, payload.to_vec()).to_bytes()
}

/// Decode a buffer holding exactly one frame. Trailing bytes after the frame are an error.
pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
    let (frame, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(DecodeError::TrailingBytes {
            frame_len: used,
            buffer_len: buf.len(),
        });
    }
    Ok(frame)
}

/// Decode the frame at the start of `buf`, returning it together with the number of bytes it
/// occupied (padding included).
pub fn decode_prefix(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::ShortHeader { actual: buf.len() });
    }
    if buf[0..2] != MAGIC {
        return Err(DecodeError::BadMagic([buf[0], buf[1]]));
    }

    let command = CommandCode::from(BE::read_u16(&buf[2..4]));
    let sequence = BE::read_u32(&buf[4..8]);
    let length_word = BE::read_u32(&buf[8..12]);
    let payload_len = (length_word & LENGTH_MASK) as usize;
    let padding = (length_word >> 24) as usize;

    if payload_len > MAX_PAYLOAD {
        return Err(DecodeError::Oversized {
            declared: payload_len,
        });
    }

    let frame_len = HEADER_SIZE + payload_len + padding;
    if buf.len() < frame_len {
        return Err(DecodeError::TruncatedFrame {
            declared: frame_len,
            actual: buf.len(),
        });
    }

    let payload = buf[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
    Ok((
        Frame {
            command,
            sequence,
            payload,
        },
        frame_len,
    ))
}

/// Reasons a frame cannot be put on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("payload of {actual} bytes is above the payload limit")]
    Oversized { actual: usize },
}

/// Reasons a byte buffer is not a valid frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("buffer of {actual} bytes is shorter than a frame header")]
    ShortHeader { actual: usize },

    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("frame declares {declared} bytes but only {actual} are available")]
    TruncatedFrame { declared: usize, actual: usize },

    #[error("frame declares a {declared}-byte payload, above the payload limit")]
    Oversized { declared: usize },

    #[error("buffer holds {buffer_len} bytes but the frame only uses {frame_len}")]
    TrailingBytes { frame_len: usize, buffer_len: usize },
}

/// Reassembles frames from the arbitrary chunks a bulk endpoint hands back. Bytes that cannot
/// start a frame are skipped until the next magic.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next frame out of the buffer. `None` means more data is needed. An `Err` is a
    /// malformed frame that has already been skipped; the caller should log it and keep going.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        self.skip_to_magic();

        match decode_prefix(&self.buffer) {
            Ok((frame, used)) => {
                self.buffer.drain(..used);
                Some(Ok(frame))
            }
            Err(DecodeError::ShortHeader { .. }) | Err(DecodeError::TruncatedFrame { .. }) => None,
            Err(e) => {
                // Drop the bad magic so the next call resynchronises on whatever follows.
                self.buffer.drain(..MAGIC.len());
                Some(Err(e))
            }
        }
    }

    /// Give up on a frame whose remaining bytes never arrived. Its magic is dropped so the next
    /// [next_frame](Self::next_frame) resynchronises on whatever follows. Returns the number of
    /// bytes that were buffered.
    pub fn discard_partial(&mut self) -> usize {
        let buffered = self.buffer.len();
        if buffered > 0 {
            self.skip_to_magic();
            let stale = self.buffer.len().min(MAGIC.len());
            self.buffer.drain(..stale);
        }
        buffered
    }

    fn skip_to_magic(&mut self) {
        let start = self
            .buffer
            .windows(MAGIC.len())
            .position(|w| w == MAGIC)
            .unwrap_or(self.buffer.len().saturating_sub(1));

        if start > 0 {
            warn!("Discarding {start} bytes of garbage before frame header");
            self.buffer.drain(..start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_lays_out_header_big_endian() {
        let bytes = encode(CommandId::GET_FILE_BLOCK, 0x0102_0304, &[0xaa, 0xbb]).unwrap();
        assert_eq!(
            bytes,
            [
                0x12, 0x34, 0x00, 0x0d, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x02, 0xaa, 0xbb
            ]
        );
    }

    #[test]
    fn round_trip_preserves_fields() {
        for (command, sequence, payload) in [
            (CommandId::GET_DEVICE_INFO, 0, vec![]),
            (CommandId::FIRMWARE_UPLOAD, u32::MAX, vec![7u8; 300]),
            (CommandId::BLUETOOTH_SCAN, 42, b"scan".to_vec()),
        ] {
            let frame = decode(&encode(command, sequence, &payload).unwrap()).unwrap();
            assert_eq!(frame, Frame::new(command, sequence, payload));
        }
    }

    #[test]
    fn every_truncation_is_an_error() {
        let bytes = encode(CommandId::GET_SETTINGS, 9, &[1, 2, 3, 4, 5]).unwrap();
        for len in 0..bytes.len() {
            assert!(decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn truncated_payload_is_reported() {
        let bytes = encode(CommandId::GET_SETTINGS, 9, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(
            decode(&bytes[..14]),
            Err(DecodeError::TruncatedFrame {
                declared: 17,
                actual: 14
            })
        );
    }

    #[test]
    fn over_length_buffer_is_an_error() {
        let mut bytes = encode(CommandId::GET_SETTINGS, 9, &[1]).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn oversized_declaration_is_rejected_without_reading() {
        let mut bytes = encode(CommandId::GET_SETTINGS, 1, &[]).unwrap();
        bytes[8..12].copy_from_slice(&0x00ff_ffffu32.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::Oversized { .. })
        ));
    }

    #[test]
    fn unknown_command_is_forwarded() {
        let mut bytes = encode(CommandId::INVALID, 5, &[9]).unwrap();
        bytes[2..4].copy_from_slice(&0x7777u16.to_be_bytes());
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.command, CommandCode::Unknown(0x7777));
        assert_eq!(frame.payload, [9]);
    }

    #[test]
    fn padding_is_skipped() {
        let mut bytes = encode(CommandId::GET_FILE_BLOCK, 3, &[1, 2, 3]).unwrap();
        bytes[8] = 2;
        bytes.extend_from_slice(&[0, 0]);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, [1, 2, 3]);
    }

    #[test]
    fn advanced_commands_live_in_reserved_range() {
        assert!(CommandId::FACTORY_RESET.is_advanced());
        assert!(CommandId::TEST_SN_WRITE.is_advanced());
        assert!(!CommandId::BLUETOOTH_STATUS.is_advanced());
    }

    #[test]
    fn assembler_handles_split_and_coalesced_chunks() {
        let a = encode(CommandId::GET_DEVICE_INFO, 1, &[1, 2, 3]).unwrap();
        let b = encode(CommandId::GET_CARD_INFO, 2, &[4; 12]).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut assembler = FrameAssembler::new();
        assembler.push(&stream[..5]);
        assert!(assembler.next_frame().is_none());
        assembler.push(&stream[5..20]);
        assert_eq!(assembler.next_frame().unwrap().unwrap().sequence, 1);
        assert!(assembler.next_frame().is_none());
        assembler.push(&stream[20..]);
        assert_eq!(assembler.next_frame().unwrap().unwrap().sequence, 2);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn assembler_resynchronises_after_garbage() {
        let mut stream = vec![0xde, 0xad, 0x12];
        stream.extend_from_slice(&encode(CommandId::GET_DEVICE_TIME, 77, &[]).unwrap());

        let mut assembler = FrameAssembler::new();
        assembler.push(&stream);
        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 77);
        assert_eq!(frame.command, CommandCode::Known(CommandId::GET_DEVICE_TIME));
    }

    #[test]
    fn assembler_reports_and_skips_oversized_frame() {
        let mut bad = encode(CommandId::GET_SETTINGS, 1, &[]).unwrap();
        bad[8..12].copy_from_slice(&0x00ff_ffffu32.to_be_bytes());
        let good = encode(CommandId::GET_SETTINGS, 2, &[]).unwrap();

        let mut assembler = FrameAssembler::new();
        assembler.push(&bad);
        assembler.push(&good);
        assert!(matches!(
            assembler.next_frame(),
            Some(Err(DecodeError::Oversized { .. }))
        ));
        assert_eq!(assembler.next_frame().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn payload_limit_applies_to_both_directions() {
        let largest = vec![0x5a; MAX_PAYLOAD];
        let frame = decode(&encode(CommandId::FIRMWARE_UPLOAD, 1, &largest).unwrap()).unwrap();
        assert_eq!(frame.len(), MAX_PAYLOAD);

        assert_eq!(
            encode(CommandId::FIRMWARE_UPLOAD, 1, &vec![0; MAX_PAYLOAD + 1]),
            Err(EncodeError::Oversized {
                actual: MAX_PAYLOAD + 1
            })
        );
        // Far past the 24-bit length field: an error, not a panic.
        let huge = Frame::new(CommandId::DEVICE_MSG_TEST, 1, vec![0; (1 << 24) + 1]);
        assert!(huge.to_bytes().is_err());
    }

    #[test]
    fn assembler_abandons_stalled_frame() {
        // Valid magic with a corrupted length: the rest of this frame will never come.
        let mut bad = encode(CommandId::GET_CARD_INFO, 999, &[]).unwrap();
        bad[8..12].copy_from_slice(&1000u32.to_be_bytes());
        let good = encode(CommandId::GET_CARD_INFO, 4, &[1]).unwrap();

        let mut assembler = FrameAssembler::new();
        assembler.push(&bad);
        assembler.push(&good);
        assert!(assembler.next_frame().is_none());

        assert_eq!(assembler.discard_partial(), bad.len() + good.len());
        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 4);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.discard_partial(), 0);
    }
}
