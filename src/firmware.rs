use crate::dispatcher::{DispatchError, Dispatcher};
use crate::frame::{CommandId, MAX_PAYLOAD};
use crate::protocol::{self, ProtocolError, UpgradeResponse, upgrade_request};
use log::{debug, error, info, warn};
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

/// A firmware image ready to be flashed, with the version number the device is told about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    version: u32,
    crc32: u32,
}

/// Errors loading a firmware image.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ImageError {
    #[error("firmware image is empty")]
    Empty,

    #[error("firmware image of {0} bytes exceeds the 32-bit size field")]
    TooLarge(usize),

    #[error("invalid firmware version {0:?}: expected MAJOR.MINOR.PATCH, each 0-255")]
    BadVersion(String),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>, version: u32) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }
        if u32::try_from(data.len()).is_err() {
            return Err(ImageError::TooLarge(data.len()));
        }

        let crc32 = compute_crc(&data);
        Ok(Self {
            data,
            version,
            crc32,
        })
    }

    /// Read a raw image from `file`.
    pub fn load(file: &mut impl Read, version: u32) -> Result<Self, ImageError> {
        let mut data = vec![];
        file.read_to_end(&mut data)?;
        Self::new(data, version)
    }

    /// Parse a dotted version ("1.2.3") into the device's version word, the same packing
    /// GET_DEVICE_INFO reports.
    pub fn parse_version(text: &str) -> Result<u32, ImageError> {
        let bad = || ImageError::BadVersion(text.to_owned());
        let parts = text
            .trim()
            .split('.')
            .map(|p| p.parse::<u8>().map_err(|_| bad()))
            .collect::<Result<Vec<_>, _>>()?;

        match parts[..] {
            [major, minor, patch] => Ok(u32::from_be_bytes([0, major, minor, patch])),
            _ => Err(bad()),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Size in bytes. Always fits the 32-bit size field.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// CRC-32 (IEEE) of the image, for identification in logs and UIs. The device performs its
    /// own verification.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }
}

/// Retry and sizing behaviour of a firmware upgrade.
#[derive(Copy, Clone, Debug)]
pub struct UpgradePolicy {
    /// The device may stage storage before acknowledging, so this is usually long.
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub chunk_size: u32,
    /// Attempts per chunk, including the first.
    pub max_chunk_attempts: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Idle,
    UpgradeRequested,
    Uploading,
    Verifying,
    Completed,
    Failed,
}

impl UpgradeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Completed | UpgradeState::Failed)
    }
}

/// Progress snapshot of an upgrade. Mutated only by [FirmwareUpgrade].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FirmwareUpgradeSession {
    pub state: UpgradeState,
    pub total_chunks: u32,
    pub chunks_sent: u32,
    /// Sequence number of the most recent acknowledged frame.
    pub last_ack_sequence: Option<u32>,
}

/// Errors that end a firmware upgrade. Unless [device_state_unknown] says otherwise, the device
/// may be left with partially written firmware and callers must tell the user so.
///
/// [device_state_unknown]: FirmwareError::device_state_unknown
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FirmwareError {
    #[error("device did not acknowledge the upgrade request; device firmware state is unknown")]
    RequestFailed {
        #[source]
        source: DispatchError,
    },

    #[error("device refused the upgrade: {response:?} ({err})", err = .response.error_str())]
    Rejected { response: UpgradeResponse },

    #[error("device answered the upgrade request with unknown status {0}")]
    UnknownResponse(u8),

    #[error(
        "chunk {index} of {total} failed after {attempts} attempts; device firmware state is unknown"
    )]
    ChunkFailed {
        index: u32,
        total: u32,
        attempts: u32,
        #[source]
        source: DispatchError,
    },

    #[error(
        "device rejected chunk {index} of {total} with status {status}; device firmware state is unknown"
    )]
    ChunkRejected { index: u32, total: u32, status: u8 },

    #[error("device reported verification failure (status {status}); device firmware state is unknown")]
    VerificationFailed { status: u8 },

    #[error("malformed reply during upgrade; device firmware state is unknown")]
    Protocol(#[from] ProtocolError),
}

impl FirmwareError {
    /// False only when the device explicitly declined before anything was written.
    pub fn device_state_unknown(&self) -> bool {
        !matches!(
            self,
            FirmwareError::Rejected { .. } | FirmwareError::UnknownResponse(_)
        )
    }
}

/// Firmware flashing as an explicit state machine:
/// `Idle → UpgradeRequested → Uploading → Verifying → Completed`, with `Failed` reachable from
/// every non-terminal state.
///
/// Chunks are sent strictly in order and each must be acknowledged before the next goes out.
/// The acknowledgement of the final chunk carries the device's verification verdict.
pub struct FirmwareUpgrade<'a> {
    dispatcher: &'a Dispatcher,
    image: &'a FirmwareImage,
    policy: UpgradePolicy,
    session: FirmwareUpgradeSession,
    final_status: Option<u8>,
}

impl<'a> FirmwareUpgrade<'a> {
    pub fn new(dispatcher: &'a Dispatcher, image: &'a FirmwareImage, policy: UpgradePolicy) -> Self {
        let policy = UpgradePolicy {
            chunk_size: policy.chunk_size.clamp(1, MAX_PAYLOAD as u32),
            max_chunk_attempts: policy.max_chunk_attempts.max(1),
            ..policy
        };

        Self {
            dispatcher,
            image,
            policy,
            session: FirmwareUpgradeSession {
                state: UpgradeState::Idle,
                total_chunks: image.size().div_ceil(policy.chunk_size),
                chunks_sent: 0,
                last_ack_sequence: None,
            },
            final_status: None,
        }
    }

    pub fn session(&self) -> FirmwareUpgradeSession {
        self.session
    }

    pub fn state(&self) -> UpgradeState {
        self.session.state
    }

    /// Perform one transition. Terminal states are returned unchanged.
    pub fn step(&mut self) -> Result<UpgradeState, FirmwareError> {
        let result = match self.session.state {
            UpgradeState::Idle => self.request().map(|()| UpgradeState::UpgradeRequested),
            UpgradeState::UpgradeRequested => Ok(UpgradeState::Uploading),
            UpgradeState::Uploading => self.upload_next().map(|()| {
                if self.session.chunks_sent == self.session.total_chunks {
                    UpgradeState::Verifying
                } else {
                    UpgradeState::Uploading
                }
            }),
            UpgradeState::Verifying => self.verify().map(|()| UpgradeState::Completed),
            state @ (UpgradeState::Completed | UpgradeState::Failed) => return Ok(state),
        };

        match result {
            Ok(state) => {
                if state != self.session.state {
                    debug!("Firmware upgrade: {:?} -> {state:?}", self.session.state);
                }
                self.session.state = state;
                if state == UpgradeState::Completed {
                    info!("Firmware upgrade to version {:#010x} completed", self.image.version());
                }
                Ok(state)
            }
            Err(e) => {
                error!(
                    "Firmware upgrade failed in state {:?} after {}/{} chunks: {e}",
                    self.session.state, self.session.chunks_sent, self.session.total_chunks
                );
                self.session.state = UpgradeState::Failed;
                Err(e)
            }
        }
    }

    /// Drive the upgrade to a terminal state, reporting the session after every transition.
    pub fn run(
        mut self,
        mut on_progress: impl FnMut(&FirmwareUpgradeSession),
    ) -> Result<(), FirmwareError> {
        while !self.session.state.is_terminal() {
            self.step()?;
            on_progress(&self.session);
        }
        Ok(())
    }

    fn request(&mut self) -> Result<(), FirmwareError> {
        info!(
            "Requesting upgrade to version {:#010x} ({} bytes, CRC32 {:#010x})",
            self.image.version(),
            self.image.size(),
            self.image.crc32()
        );

        let payload = upgrade_request(self.image.version(), self.image.size());
        let frame = self
            .dispatcher
            .send(
                CommandId::REQUEST_FIRMWARE_UPGRADE,
                &payload,
                self.policy.request_timeout,
            )
            .map_err(|source| FirmwareError::RequestFailed { source })?;

        let status = protocol::status_byte(CommandId::REQUEST_FIRMWARE_UPGRADE, &frame.payload)?;
        match UpgradeResponse::try_from(status) {
            Ok(UpgradeResponse::Accepted) => {
                self.session.last_ack_sequence = Some(frame.sequence);
                Ok(())
            }
            Ok(response) => Err(FirmwareError::Rejected { response }),
            Err(e) => Err(FirmwareError::UnknownResponse(e.number)),
        }
    }

    fn upload_next(&mut self) -> Result<(), FirmwareError> {
        let index = self.session.chunks_sent;
        let total = self.session.total_chunks;
        let start = (index * self.policy.chunk_size) as usize;
        let end = (start + self.policy.chunk_size as usize).min(self.image.data().len());
        let chunk = &self.image.data()[start..end];

        let mut attempts = 0;
        let frame = loop {
            attempts += 1;
            match self.dispatcher.send(
                CommandId::FIRMWARE_UPLOAD,
                chunk,
                self.policy.chunk_timeout,
            ) {
                Ok(frame) => break frame,
                Err(e) if e.is_recoverable() && attempts < self.policy.max_chunk_attempts => {
                    warn!(
                        "Resending firmware chunk {index} (attempt {attempts}/{}): {e}",
                        self.policy.max_chunk_attempts
                    );
                }
                Err(source) => {
                    return Err(FirmwareError::ChunkFailed {
                        index,
                        total,
                        attempts,
                        source,
                    });
                }
            }
        };

        let status = protocol::status_byte(CommandId::FIRMWARE_UPLOAD, &frame.payload)?;
        self.session.chunks_sent += 1;
        self.session.last_ack_sequence = Some(frame.sequence);

        if self.session.chunks_sent == total {
            // The device verifies the whole image before answering the last chunk.
            self.final_status = Some(status);
        } else if status != 0 {
            return Err(FirmwareError::ChunkRejected {
                index,
                total,
                status,
            });
        }

        debug!("Firmware chunk {}/{total} acknowledged", index + 1);
        Ok(())
    }

    fn verify(&mut self) -> Result<(), FirmwareError> {
        match self.final_status {
            Some(0) | None => Ok(()),
            Some(status) => Err(FirmwareError::VerificationFailed { status }),
        }
    }
}

impl Iterator for FirmwareUpgrade<'_> {
    type Item = Result<FirmwareUpgradeSession, FirmwareError>;

    /// Yields the session after each transition until a terminal state is reached.
    fn next(&mut self) -> Option<Self::Item> {
        if self.session.state.is_terminal() {
            return None;
        }
        Some(self.step().map(|_| self.session))
    }
}
