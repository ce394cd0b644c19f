//! Payload layouts of the individual commands. Everything on the wire is big-endian; replies
//! that only report success carry a status byte first, where 0 means OK.

use crate::frame::CommandId;
use byteorder::{BE, ByteOrder, WriteBytesExt};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use num_enum::TryFromPrimitive;
use thiserror::Error;

const SERIAL_LEN: usize = 16;
const BCD_TIME_LEN: usize = 7;
const FILE_LIST_MARKER: [u8; 2] = [0xff, 0xff];
const FILE_ENTRY_RESERVED: usize = 6;
const SIGNATURE_LEN: usize = 16;
const SETTINGS_LEN: usize = 16;
const SCHEDULE_RECORD_LEN: usize = 16;

/// Confirmation bytes the device expects with destructive commands.
pub const CONFIRM_MAGIC: [u8; 4] = [1, 2, 3, 4];

/// Payload problems that can happen even when the exchange itself succeeded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("{command} reply was {actual} bytes, expected at least {expected}")]
    ShortPayload {
        command: CommandId,
        expected: usize,
        actual: usize,
    },

    #[error("device reported failure status {status} for {command}")]
    CommandFailed { command: CommandId, status: u8 },

    #[error("device returned invalid BCD byte {0:#04x}")]
    InvalidBcd(u8),

    #[error("device returned an impossible date/time {0}")]
    InvalidTime(String),

    #[error("device returned invalid UTF-8 string")]
    InvalidString(#[from] std::str::Utf8Error),

    #[error("file name of {0} bytes does not fit the length field")]
    NameTooLong(usize),
}

fn ensure_len(command: CommandId, payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() < expected {
        Err(ProtocolError::ShortPayload {
            command,
            expected,
            actual: payload.len(),
        })
    } else {
        Ok(())
    }
}

/// First byte of a reply.
pub fn status_byte(command: CommandId, payload: &[u8]) -> Result<u8, ProtocolError> {
    ensure_len(command, payload, 1)?;
    Ok(payload[0])
}

/// Fail unless the reply's status byte is 0.
pub fn check_status(command: CommandId, payload: &[u8]) -> Result<(), ProtocolError> {
    match status_byte(command, payload)? {
        0 => Ok(()),
        status => Err(ProtocolError::CommandFailed { command, status }),
    }
}

/// Text up to the first NUL.
fn c_string(bytes: &[u8]) -> Result<String, ProtocolError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(std::str::from_utf8(&bytes[..end])?.to_owned())
}

/// Identity the device reports for GET_DEVICE_INFO.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Dotted firmware version, e.g. "1.2.3".
    pub version_code: String,
    pub version_number: u32,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(CommandId::GET_DEVICE_INFO, payload, 4)?;

        // The top byte of the version word is unused; the other three are major.minor.patch.
        let version_number = BE::read_u32(&payload[0..4]);
        let version_code = format!("{}.{}.{}", payload[1], payload[2], payload[3]);
        let serial_end = payload.len().min(4 + SERIAL_LEN);
        let serial_number = c_string(&payload[4..serial_end])?;

        Ok(Self {
            version_code,
            version_number,
            serial_number,
        })
    }
}

fn from_bcd(byte: u8) -> Result<u32, ProtocolError> {
    let (hi, lo) = (byte >> 4, byte & 0x0f);
    if hi > 9 || lo > 9 {
        return Err(ProtocolError::InvalidBcd(byte));
    }
    Ok((hi * 10 + lo) as u32)
}

fn to_bcd(value: u32) -> u8 {
    let value = (value % 100) as u8;
    ((value / 10) << 4) | (value % 10)
}

/// Encode a timestamp as the device's 7-byte BCD `YYYY MM DD hh mm ss`.
pub fn encode_bcd_time(time: &NaiveDateTime) -> [u8; BCD_TIME_LEN] {
    let year = time.year().clamp(0, 9999) as u32;
    [
        to_bcd(year / 100),
        to_bcd(year),
        to_bcd(time.month()),
        to_bcd(time.day()),
        to_bcd(time.hour()),
        to_bcd(time.minute()),
        to_bcd(time.second()),
    ]
}

/// Decode a 7-byte BCD timestamp. All zeroes means the clock was never set.
pub fn decode_bcd_time(bytes: &[u8]) -> Result<Option<NaiveDateTime>, ProtocolError> {
    ensure_len(CommandId::GET_DEVICE_TIME, bytes, BCD_TIME_LEN)?;
    let bytes = &bytes[..BCD_TIME_LEN];
    if bytes.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let mut digits = [0u32; BCD_TIME_LEN];
    for (digit, &byte) in digits.iter_mut().zip(bytes) {
        *digit = from_bcd(byte)?;
    }
    let [century, year, month, day, hour, minute, second] = digits;

    NaiveDate::from_ymd_opt((century * 100 + year) as i32, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .map(Some)
        .ok_or_else(|| ProtocolError::InvalidTime(format!("{bytes:02x?}")))
}

/// A recording stored on the device, as listed by GET_FILE_LIST.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Size in bytes.
    pub length: u32,
    /// Recording format version.
    pub version: u8,
    pub signature: [u8; SIGNATURE_LEN],
}

impl FileEntry {
    pub fn new(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            length,
            version: 1,
            signature: [0; SIGNATURE_LEN],
        }
    }

    /// Append this entry in listing format.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let name = self.name.as_bytes();
        if name.len() > 0x00ff_ffff {
            return Err(ProtocolError::NameTooLong(name.len()));
        }
        out.push(self.version);
        // Writes into a Vec cannot fail.
        out.write_u24::<BE>(name.len() as u32).unwrap();
        out.extend_from_slice(name);
        out.write_u32::<BE>(self.length).unwrap();
        out.extend_from_slice(&[0; FILE_ENTRY_RESERVED]);
        out.extend_from_slice(&self.signature);
        Ok(())
    }
}

/// Parse a GET_FILE_LIST reply, with or without the leading total-count marker.
pub fn parse_file_list(payload: &[u8]) -> Result<Vec<FileEntry>, ProtocolError> {
    const COMMAND: CommandId = CommandId::GET_FILE_LIST;

    let mut rest = payload;
    if rest.starts_with(&FILE_LIST_MARKER) {
        ensure_len(COMMAND, rest, 6)?;
        rest = &rest[6..];
    }

    let mut entries = Vec::new();
    while !rest.is_empty() {
        let consumed = payload.len() - rest.len();
        let short = |needed: usize| ProtocolError::ShortPayload {
            command: COMMAND,
            expected: consumed + needed,
            actual: payload.len(),
        };

        if rest.len() < 4 {
            return Err(short(4));
        }
        let version = rest[0];
        let name_len = BE::read_u24(&rest[1..4]) as usize;
        let entry_len = 4 + name_len + 4 + FILE_ENTRY_RESERVED + SIGNATURE_LEN;
        if rest.len() < entry_len {
            return Err(short(entry_len));
        }

        let name = c_string(&rest[4..4 + name_len])?;
        let at = 4 + name_len;
        let length = BE::read_u32(&rest[at..at + 4]);
        let sig_at = at + 4 + FILE_ENTRY_RESERVED;
        let mut signature = [0; SIGNATURE_LEN];
        signature.copy_from_slice(&rest[sig_at..sig_at + SIGNATURE_LEN]);

        entries.push(FileEntry {
            name,
            length,
            version,
            signature,
        });
        rest = &rest[entry_len..];
    }

    Ok(entries)
}

/// Build a GET_FILE_LIST reply carrying the total-count marker.
pub fn encode_file_list(entries: &[FileEntry]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = FILE_LIST_MARKER.to_vec();
    out.write_u32::<BE>(entries.len() as u32).unwrap();
    for entry in entries {
        entry.encode_into(&mut out)?;
    }
    Ok(out)
}

/// GET_FILE_BLOCK request: `[offset u32][length u32][name]`.
pub fn file_block_request(name: &str, offset: u32, length: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + name.len());
    out.write_u32::<BE>(offset).unwrap();
    out.write_u32::<BE>(length).unwrap();
    out.extend_from_slice(name.as_bytes());
    out
}

/// Inverse of [file_block_request], for device simulators.
pub fn parse_file_block_request(payload: &[u8]) -> Result<(String, u32, u32), ProtocolError> {
    ensure_len(CommandId::GET_FILE_BLOCK, payload, 8)?;
    let offset = BE::read_u32(&payload[0..4]);
    let length = BE::read_u32(&payload[4..8]);
    Ok((c_string(&payload[8..])?, offset, length))
}

/// Status of DELETE_FILE.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum DeleteStatus {
    Deleted = 0,
    NotFound = 1,
    Failed = 2,
}

/// Current device settings.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSettings {
    pub auto_record: bool,
    pub auto_play: bool,
    pub notification: bool,
    pub bluetooth_tone: bool,
}

impl DeviceSettings {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(CommandId::GET_SETTINGS, payload, SETTINGS_LEN)?;
        let slot = |i: usize| payload[i * 4 + 3] == 1;
        Ok(Self {
            auto_record: slot(0),
            auto_play: slot(1),
            notification: slot(2),
            bluetooth_tone: slot(3),
        })
    }

    /// The GET_SETTINGS reply describing these settings.
    pub fn encode(&self) -> [u8; SETTINGS_LEN] {
        SettingsUpdate {
            auto_record: Some(self.auto_record),
            auto_play: Some(self.auto_play),
            notification: Some(self.notification),
            bluetooth_tone: Some(self.bluetooth_tone),
        }
        .encode()
    }
}

/// Partial settings change for SET_SETTINGS. `None` leaves a setting untouched.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub auto_record: Option<bool>,
    pub auto_play: Option<bool>,
    pub notification: Option<bool>,
    pub bluetooth_tone: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn encode(&self) -> [u8; SETTINGS_LEN] {
        let mut out = [0u8; SETTINGS_LEN];
        let fields = [
            self.auto_record,
            self.auto_play,
            self.notification,
            self.bluetooth_tone,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            out[i * 4 + 3] = match value {
                None => 0,
                Some(true) => 1,
                Some(false) => 2,
            };
        }
        out
    }

    /// Apply to `settings`, as the device would.
    pub fn apply_to(&self, settings: &mut DeviceSettings) {
        let pairs = [
            (self.auto_record, &mut settings.auto_record),
            (self.auto_play, &mut settings.auto_play),
            (self.notification, &mut settings.notification),
            (self.bluetooth_tone, &mut settings.bluetooth_tone),
        ];
        for (update, current) in pairs {
            if let Some(value) = update {
                *current = value;
            }
        }
    }
}

/// Storage card state, sizes in MiB.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardInfo {
    pub free_mib: u32,
    pub capacity_mib: u32,
    pub status: u32,
}

impl CardInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(CommandId::GET_CARD_INFO, payload, 12)?;
        Ok(Self {
            free_mib: BE::read_u32(&payload[0..4]),
            capacity_mib: BE::read_u32(&payload[4..8]),
            status: BE::read_u32(&payload[8..12]),
        })
    }

    pub fn used_mib(&self) -> u32 {
        self.capacity_mib.saturating_sub(self.free_mib)
    }
}

/// Meeting platform a calendar event belongs to. Selects the shortcut the device's button
/// triggers during that meeting.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, TryFromPrimitive)]
pub enum MeetingApp {
    #[default]
    Other = 0,
    Zoom = 1,
    Teams = 2,
    GoogleMeet = 3,
    Webex = 4,
    Feishu = 5,
    Slack = 6,
    Discord = 7,
}

/// One calendar entry pushed with SEND_MEETING_SCHEDULE_INFO.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub app: MeetingApp,
}

/// SEND_MEETING_SCHEDULE_INFO request: one 16-byte record per event. An empty list clears the
/// device's schedule.
pub fn encode_schedule(events: &[ScheduleEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * SCHEDULE_RECORD_LEN);
    for event in events {
        out.extend_from_slice(&encode_bcd_time(&event.start));
        out.extend_from_slice(&encode_bcd_time(&event.end));
        out.push(event.app as u8);
        out.push(0);
    }
    out
}

/// REQUEST_FIRMWARE_UPGRADE request: `[version u32][size u32]`.
pub fn upgrade_request(version: u32, size: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    BE::write_u32(&mut out[0..4], version);
    BE::write_u32(&mut out[4..8], size);
    out
}

/// Reply to REQUEST_FIRMWARE_UPGRADE.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum UpgradeResponse {
    Accepted = 0,
    WrongVersion = 1,
    Busy = 2,
    CardFull = 3,
    CardError = 4,
}

impl UpgradeResponse {
    pub fn error_str(&self) -> &'static str {
        use UpgradeResponse::*;
        match self {
            Accepted => "Device is ready to receive the image.",
            WrongVersion => "Image version is not newer than the installed firmware.",
            Busy => "Device is busy with another operation.",
            CardFull => "Not enough free space on the card to stage the image.",
            CardError => "Card could not be accessed to stage the image.",
        }
    }
}
