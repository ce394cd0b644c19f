use crate::device_ids::DeviceIdentity;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::firmware::{
    FirmwareError, FirmwareImage, FirmwareUpgrade, FirmwareUpgradeSession, UpgradePolicy,
};
use crate::frame::{CommandId, Frame, MAX_PAYLOAD};
use crate::protocol::{
    self, CONFIRM_MAGIC, CardInfo, DeleteStatus, DeviceInfo, DeviceSettings, FileEntry,
    ProtocolError, ScheduleEvent, SettingsUpdate,
};
use crate::transfer::{Block, FileDownload, FileHandle, TransferError, TransferPolicy};
use crate::transport::{Transport, TransportError, UsbTransport};
use byteorder::{BE, ByteOrder};
use chrono::NaiveDateTime;
use log::{error, info, warn};
use std::fmt::Display;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunables of a session. The defaults suit real hardware.
#[derive(Copy, Clone, Debug)]
pub struct SessionConfig {
    /// Timeout for simple request/response commands.
    pub command_timeout: Duration,
    pub block_timeout: Duration,
    /// Bytes per GET_FILE_BLOCK exchange.
    pub block_size: u32,
    /// Attempts per file block, including the first.
    pub block_attempts: u32,
    /// Bytes per FIRMWARE_UPLOAD exchange.
    pub chunk_size: u32,
    pub chunk_timeout: Duration,
    /// Attempts per firmware chunk, including the first.
    pub chunk_attempts: u32,
    /// The device prepares storage before acknowledging an upgrade request.
    pub upgrade_request_timeout: Duration,
    /// Formatting the card takes a while on large cards.
    pub format_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(10),
            block_size: 32 * 1024,
            block_attempts: 3,
            chunk_size: 16 * 1024,
            chunk_timeout: Duration::from_secs(10),
            chunk_attempts: 3,
            upgrade_request_timeout: Duration::from_secs(60),
            format_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), PreconditionError> {
        let max = MAX_PAYLOAD as u32;
        if self.block_size == 0 || self.block_size > max {
            return Err(PreconditionError::InvalidConfig("block size out of range"));
        }
        if self.chunk_size == 0 || self.chunk_size > max {
            return Err(PreconditionError::InvalidConfig("chunk size out of range"));
        }
        if self.block_attempts == 0 || self.chunk_attempts == 0 {
            return Err(PreconditionError::InvalidConfig("attempt counts must be non-zero"));
        }
        Ok(())
    }

    fn transfer_policy(&self) -> TransferPolicy {
        TransferPolicy {
            block_timeout: self.block_timeout,
            max_attempts: self.block_attempts,
        }
    }

    fn upgrade_policy(&self) -> UpgradePolicy {
        UpgradePolicy {
            request_timeout: self.upgrade_request_timeout,
            chunk_timeout: self.chunk_timeout,
            chunk_size: self.chunk_size,
            max_chunk_attempts: self.chunk_attempts,
        }
    }
}

/// Long-running operations that must not overlap on one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeavyOperation {
    Download { name: String },
    FirmwareUpgrade,
    FormatCard,
}

impl Display for HeavyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HeavyOperation::Download { name } => write!(f, "download of {name}"),
            HeavyOperation::FirmwareUpgrade => write!(f, "firmware upgrade"),
            HeavyOperation::FormatCard => write!(f, "card format"),
        }
    }
}

/// Requests rejected before anything is sent to the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PreconditionError {
    #[error("files have not been listed yet in this session")]
    NotListed,

    #[error("no file named {0:?} in the last listing; list files again")]
    UnknownFile(String),

    #[error("{0:?} is being downloaded")]
    FileBusy(String),

    #[error("handle for {0:?} does not match the last listing and configuration")]
    StaleHandle(String),

    #[error("cannot start {requested} while a {active} is in progress")]
    HeavyOperationActive {
        active: HeavyOperation,
        requested: HeavyOperation,
    },

    #[error("settings update changes nothing")]
    EmptySettingsUpdate,

    #[error("schedule event {index} ends before it starts")]
    InvalidEvent { index: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Everything a [DeviceSession] operation can fail with.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("device link failed")]
    Transport(#[from] TransportError),

    #[error("request failed")]
    Dispatch(#[from] DispatchError),

    #[error("unexpected reply from device")]
    Protocol(#[from] ProtocolError),

    #[error("file transfer failed")]
    Transfer(#[from] TransferError),

    #[error("firmware upgrade failed")]
    Firmware(#[from] FirmwareError),

    #[error("request rejected")]
    Precondition(#[from] PreconditionError),
}

impl Error {
    /// Whether the session is unusable and the caller has to connect again.
    pub fn is_session_fatal(&self) -> bool {
        let link_failed =
            |e: &DispatchError| matches!(e, DispatchError::Transport(t) if t.is_fatal());
        match self {
            Error::Transport(e) => e.is_fatal(),
            Error::Dispatch(e)
            | Error::Transfer(TransferError::Aborted { source: e, .. })
            | Error::Firmware(FirmwareError::RequestFailed { source: e })
            | Error::Firmware(FirmwareError::ChunkFailed { source: e, .. }) => link_failed(e),
            _ => false,
        }
    }
}

/// Marks a heavy operation as running until dropped.
struct HeavyGuard<'a> {
    slot: &'a Mutex<Option<HeavyOperation>>,
}

impl Drop for HeavyGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// A download holding the session's heavy-operation slot. Iterate it to fetch blocks.
pub struct Download<'a> {
    inner: FileDownload<'a>,
    _guard: HeavyGuard<'a>,
}

impl Download<'_> {
    /// Offset of the next block. Persist this to resume after a failure.
    pub fn offset(&self) -> u32 {
        self.inner.offset()
    }

    pub fn total_size(&self) -> u32 {
        self.inner.session().handle.total_size
    }

    pub fn collect_bytes(self, on_progress: impl FnMut(u32, u32)) -> Result<Vec<u8>, Error> {
        Ok(self.inner.collect_bytes(on_progress)?)
    }
}

impl Iterator for Download<'_> {
    type Item = Result<Block, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// A firmware upgrade holding the session's heavy-operation slot.
pub struct Upgrade<'a> {
    inner: FirmwareUpgrade<'a>,
    _guard: HeavyGuard<'a>,
}

impl Upgrade<'_> {
    pub fn session(&self) -> FirmwareUpgradeSession {
        self.inner.session()
    }

    pub fn run(self, on_progress: impl FnMut(&FirmwareUpgradeSession)) -> Result<(), Error> {
        self.inner.run(on_progress).map_err(report_firmware_failure)
    }
}

impl Iterator for Upgrade<'_> {
    type Item = Result<FirmwareUpgradeSession, FirmwareError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

fn report_firmware_failure(e: FirmwareError) -> Error {
    if e.device_state_unknown() {
        error!("DEVICE FIRMWARE MAY BE CORRUPT: {e}. Do not unplug; retry the upgrade.");
    }
    e.into()
}

/// The public face of one connected device.
///
/// Owns the transport and dispatcher. All operations take `&self` and may be called from
/// several threads; downloads, firmware upgrades and card formatting exclude each other.
pub struct DeviceSession {
    identity: Option<DeviceIdentity>,
    config: SessionConfig,
    dispatcher: Dispatcher,
    heavy: Mutex<Option<HeavyOperation>>,
    listing: Mutex<Option<Vec<FileEntry>>>,
}

impl DeviceSession {
    /// Open the device over USB.
    pub fn connect(identity: &DeviceIdentity, config: SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        let transport = UsbTransport::connect(identity)?;
        let mut session = Self::with_transport(transport, config)?;
        session.identity = Some(*identity);
        Ok(session)
    }

    /// Run a session over any transport, e.g. a simulated device.
    pub fn with_transport(
        transport: impl Transport + 'static,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let dispatcher = Dispatcher::start(Arc::new(transport))?;
        Ok(Self {
            identity: None,
            config,
            dispatcher,
            heavy: Mutex::new(None),
            listing: Mutex::new(None),
        })
    }

    /// Release the device.
    pub fn disconnect(mut self) {
        self.dispatcher.shutdown();
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_alive()
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The heavy operation currently running, if any.
    pub fn active_operation(&self) -> Option<HeavyOperation> {
        self.heavy.lock().clone()
    }

    fn call(&self, command: CommandId, payload: &[u8]) -> Result<Frame, Error> {
        Ok(self
            .dispatcher
            .send(command, payload, self.config.command_timeout)?)
    }

    fn call_checked(&self, command: CommandId, payload: &[u8]) -> Result<(), Error> {
        let frame = self.call(command, payload)?;
        Ok(protocol::check_status(command, &frame.payload)?)
    }

    fn begin_heavy(&self, requested: HeavyOperation) -> Result<HeavyGuard<'_>, PreconditionError> {
        let mut slot = self.heavy.lock();
        if let Some(active) = slot.as_ref() {
            return Err(PreconditionError::HeavyOperationActive {
                active: active.clone(),
                requested,
            });
        }
        *slot = Some(requested);
        Ok(HeavyGuard { slot: &self.heavy })
    }

    /// Send any command and return the raw reply. No payload interpretation is done.
    pub fn request(
        &self,
        command: CommandId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Frame, Error> {
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        Ok(self.dispatcher.send(command, payload, timeout)?)
    }

    pub fn get_device_info(&self) -> Result<DeviceInfo, Error> {
        let frame = self.call(CommandId::GET_DEVICE_INFO, &[])?;
        Ok(DeviceInfo::parse(&frame.payload)?)
    }

    /// The device clock, or `None` if it was never set.
    pub fn get_device_time(&self) -> Result<Option<NaiveDateTime>, Error> {
        let frame = self.call(CommandId::GET_DEVICE_TIME, &[])?;
        Ok(protocol::decode_bcd_time(&frame.payload)?)
    }

    pub fn set_device_time(&self, time: &NaiveDateTime) -> Result<(), Error> {
        info!("Setting device time to {time}");
        self.call_checked(CommandId::SET_DEVICE_TIME, &protocol::encode_bcd_time(time))
    }

    pub fn get_file_count(&self) -> Result<u32, Error> {
        let frame = self.call(CommandId::GET_FILE_COUNT, &[])?;
        if frame.payload.len() < 4 {
            return Err(ProtocolError::ShortPayload {
                command: CommandId::GET_FILE_COUNT,
                expected: 4,
                actual: frame.payload.len(),
            }
            .into());
        }
        Ok(BE::read_u32(&frame.payload[0..4]))
    }

    /// List recordings. The result becomes the reference for later file operations.
    pub fn list_files(&self) -> Result<Vec<FileEntry>, Error> {
        let frame = self.call(CommandId::GET_FILE_LIST, &[])?;
        let entries = protocol::parse_file_list(&frame.payload)?;
        info!("Device holds {} recordings", entries.len());
        *self.listing.lock() = Some(entries.clone());
        Ok(entries)
    }

    /// Handle for a file from the last listing.
    pub fn file_handle(&self, name: &str) -> Result<FileHandle, Error> {
        let listing = self.listing.lock();
        let entries = listing.as_ref().ok_or(PreconditionError::NotListed)?;
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| PreconditionError::UnknownFile(name.to_owned()))?;

        Ok(FileHandle {
            name: entry.name.clone(),
            total_size: entry.length,
            block_size: self.config.block_size,
        })
    }

    pub fn delete_file(&self, name: &str) -> Result<(), Error> {
        self.file_handle(name)?;
        // Held until the device has answered so no download of this file can start meanwhile.
        let heavy = self.heavy.lock();
        if matches!(heavy.as_ref(), Some(HeavyOperation::Download { name: busy }) if busy == name) {
            return Err(PreconditionError::FileBusy(name.to_owned()).into());
        }

        let frame = self.call(CommandId::DELETE_FILE, name.as_bytes())?;
        drop(heavy);
        let status = protocol::status_byte(CommandId::DELETE_FILE, &frame.payload)?;
        let failed = ProtocolError::CommandFailed {
            command: CommandId::DELETE_FILE,
            status,
        };
        match DeleteStatus::try_from(status) {
            Ok(DeleteStatus::Deleted) => {
                self.forget_file(name);
                info!("Deleted {name}");
                Ok(())
            }
            Ok(DeleteStatus::NotFound) => {
                self.forget_file(name);
                warn!("{name} was already gone from the device");
                Err(failed.into())
            }
            _ => Err(failed.into()),
        }
    }

    fn forget_file(&self, name: &str) {
        if let Some(entries) = self.listing.lock().as_mut() {
            entries.retain(|e| e.name != name);
        }
    }

    pub fn get_settings(&self) -> Result<DeviceSettings, Error> {
        let frame = self.call(CommandId::GET_SETTINGS, &[])?;
        Ok(DeviceSettings::parse(&frame.payload)?)
    }

    pub fn set_settings(&self, update: &SettingsUpdate) -> Result<(), Error> {
        if update.is_empty() {
            return Err(PreconditionError::EmptySettingsUpdate.into());
        }
        self.call_checked(CommandId::SET_SETTINGS, &update.encode())
    }

    pub fn get_card_info(&self) -> Result<CardInfo, Error> {
        let frame = self.call(CommandId::GET_CARD_INFO, &[])?;
        Ok(CardInfo::parse(&frame.payload)?)
    }

    /// Erase every recording. Excludes downloads and upgrades while running.
    pub fn format_card(&self) -> Result<(), Error> {
        let _guard = self.begin_heavy(HeavyOperation::FormatCard)?;
        warn!("Formatting storage card");

        let frame = self.dispatcher.send(
            CommandId::FORMAT_CARD,
            &CONFIRM_MAGIC,
            self.config.format_timeout,
        )?;
        *self.listing.lock() = None;
        Ok(protocol::check_status(CommandId::FORMAT_CARD, &frame.payload)?)
    }

    pub fn restore_factory_settings(&self) -> Result<(), Error> {
        warn!("Restoring factory settings");
        self.call_checked(CommandId::RESTORE_FACTORY_SETTINGS, &CONFIRM_MAGIC)
    }

    /// Replace the device's meeting schedule. An empty list clears it.
    pub fn send_schedule_info(&self, events: &[ScheduleEvent]) -> Result<(), Error> {
        if let Some(index) = events.iter().position(|e| e.end < e.start) {
            return Err(PreconditionError::InvalidEvent { index }.into());
        }
        info!("Sending {} schedule events", events.len());
        self.call_checked(
            CommandId::SEND_MEETING_SCHEDULE_INFO,
            &protocol::encode_schedule(events),
        )
    }

    /// Start downloading a file from the last listing.
    pub fn begin_download(&self, name: &str) -> Result<Download<'_>, Error> {
        let handle = self.file_handle(name)?;
        self.resume_download(handle, 0)
    }

    /// Continue a download from `offset`, e.g. after an earlier attempt failed. `handle` must
    /// still match what [file_handle](Self::file_handle) returns.
    pub fn resume_download(&self, handle: FileHandle, offset: u32) -> Result<Download<'_>, Error> {
        let current = self.file_handle(&handle.name)?;
        if handle != current {
            return Err(PreconditionError::StaleHandle(handle.name).into());
        }
        let guard = self.begin_heavy(HeavyOperation::Download {
            name: current.name.clone(),
        })?;
        let inner = FileDownload::resume(
            &self.dispatcher,
            current,
            offset,
            self.config.transfer_policy(),
        )?;
        Ok(Download {
            inner,
            _guard: guard,
        })
    }

    /// Download a whole file, reporting `(bytes_received, total_size)` after each block.
    pub fn download_file(
        &self,
        name: &str,
        on_progress: impl FnMut(u32, u32),
    ) -> Result<Vec<u8>, Error> {
        self.begin_download(name)?.collect_bytes(on_progress)
    }

    /// Prepare a firmware upgrade. Nothing is sent until the returned value is driven.
    pub fn begin_firmware_upgrade<'a>(
        &'a self,
        image: &'a FirmwareImage,
    ) -> Result<Upgrade<'a>, Error> {
        let guard = self.begin_heavy(HeavyOperation::FirmwareUpgrade)?;
        Ok(Upgrade {
            inner: FirmwareUpgrade::new(&self.dispatcher, image, self.config.upgrade_policy()),
            _guard: guard,
        })
    }

    /// Flash `image`, reporting progress after every state transition. On failure the device
    /// may be left without working firmware; see [FirmwareError::device_state_unknown].
    pub fn start_firmware_upgrade(
        &self,
        image: &FirmwareImage,
        on_progress: impl FnMut(&FirmwareUpgradeSession),
    ) -> Result<(), Error> {
        self.begin_firmware_upgrade(image)?.run(on_progress)
    }
}
