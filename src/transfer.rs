use crate::dispatcher::{DispatchError, Dispatcher};
use crate::frame::CommandId;
use crate::protocol::file_block_request;
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;

/// A downloadable file: name, size in bytes, and the block size to fetch it with. Read-only
/// once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHandle {
    pub name: String,
    pub total_size: u32,
    pub block_size: u32,
}

impl FileHandle {
    /// Number of GET_FILE_BLOCK exchanges needed for the whole file.
    pub fn block_count(&self) -> u32 {
        self.total_size.div_ceil(self.block_size.max(1))
    }
}

/// Retry behaviour for block fetches.
#[derive(Copy, Clone, Debug)]
pub struct TransferPolicy {
    pub block_timeout: Duration,
    /// Attempts per block, including the first.
    pub max_attempts: u32,
}

/// Progress of one download. Mutated only by [FileDownload].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSession {
    pub handle: FileHandle,
    pub next_offset: u32,
    pub bytes_received: u32,
    /// Attempts spent on the block at `next_offset`.
    pub attempts: u32,
}

/// One block delivered in file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub offset: u32,
    pub data: Vec<u8>,
    pub bytes_received: u32,
    pub total_size: u32,
}

/// Why a single block attempt failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BlockError {
    #[error("request failed")]
    Dispatch(#[from] DispatchError),

    #[error("device returned {actual} bytes, expected {expected}")]
    WrongLength { expected: u32, actual: usize },
}

/// Failures ending a download. The session itself stays usable after
/// [BlockFailed](TransferError::BlockFailed).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransferError {
    #[error("block at offset {offset} failed after {attempts} attempts")]
    BlockFailed {
        offset: u32,
        attempts: u32,
        #[source]
        last: BlockError,
    },

    #[error("transfer aborted at offset {offset}")]
    Aborted {
        offset: u32,
        #[source]
        source: DispatchError,
    },

    #[error("block size must be non-zero")]
    ZeroBlockSize,

    #[error("resume offset {offset} is past the end of the {total_size}-byte file")]
    OffsetOutOfRange { offset: u32, total_size: u32 },
}

/// Sequential block-by-block download. Each call to [Iterator::next] performs one block
/// exchange (with retries) and yields the block; dropping the iterator abandons the transfer.
/// After an error the iterator is exhausted.
pub struct FileDownload<'a> {
    dispatcher: &'a Dispatcher,
    policy: TransferPolicy,
    session: TransferSession,
    failed: bool,
}

impl<'a> FileDownload<'a> {
    pub fn new(
        dispatcher: &'a Dispatcher,
        handle: FileHandle,
        policy: TransferPolicy,
    ) -> Result<Self, TransferError> {
        Self::resume(dispatcher, handle, 0, policy)
    }

    /// Continue a download whose first `offset` bytes the caller already holds.
    pub fn resume(
        dispatcher: &'a Dispatcher,
        handle: FileHandle,
        offset: u32,
        policy: TransferPolicy,
    ) -> Result<Self, TransferError> {
        if handle.block_size == 0 {
            return Err(TransferError::ZeroBlockSize);
        }
        if offset > handle.total_size {
            return Err(TransferError::OffsetOutOfRange {
                offset,
                total_size: handle.total_size,
            });
        }

        info!(
            "Downloading {} ({} bytes, {} blocks of {}) from offset {offset}",
            handle.name,
            handle.total_size,
            handle.block_count(),
            handle.block_size
        );

        Ok(Self {
            dispatcher,
            policy,
            session: TransferSession {
                handle,
                next_offset: offset,
                bytes_received: offset,
                attempts: 0,
            },
            failed: false,
        })
    }

    /// Offset of the next block to fetch. Persist this to resume after a failure.
    pub fn offset(&self) -> u32 {
        self.session.next_offset
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn is_complete(&self) -> bool {
        self.session.bytes_received == self.session.handle.total_size
    }

    /// Drive the download to completion, reporting `(bytes_received, total_size)` after every
    /// block, and return the file contents.
    pub fn collect_bytes(
        mut self,
        mut on_progress: impl FnMut(u32, u32),
    ) -> Result<Vec<u8>, TransferError> {
        let mut data = Vec::with_capacity(
            (self.session.handle.total_size - self.session.next_offset) as usize,
        );
        for block in &mut self {
            let block = block?;
            data.extend_from_slice(&block.data);
            on_progress(block.bytes_received, block.total_size);
        }
        Ok(data)
    }

    fn fetch_block(&mut self) -> Result<Block, TransferError> {
        let handle = &self.session.handle;
        let offset = self.session.next_offset;
        // The last block asks for exactly the remainder.
        let want = handle.block_size.min(handle.total_size - offset);
        let request = file_block_request(&handle.name, offset, want);

        loop {
            self.session.attempts += 1;
            let attempt = self.session.attempts;

            let last = match self.dispatcher.send(
                CommandId::GET_FILE_BLOCK,
                &request,
                self.policy.block_timeout,
            ) {
                Ok(frame) if frame.payload.len() == want as usize => {
                    self.session.attempts = 0;
                    self.session.next_offset += want;
                    self.session.bytes_received += want;
                    debug!(
                        "Block at offset {offset} received ({}/{})",
                        self.session.bytes_received, self.session.handle.total_size
                    );
                    return Ok(Block {
                        offset,
                        data: frame.payload,
                        bytes_received: self.session.bytes_received,
                        total_size: self.session.handle.total_size,
                    });
                }
                Ok(frame) => BlockError::WrongLength {
                    expected: want,
                    actual: frame.payload.len(),
                },
                Err(e) if e.is_recoverable() => BlockError::Dispatch(e),
                Err(source) => return Err(TransferError::Aborted { offset, source }),
            };

            if attempt >= self.policy.max_attempts {
                warn!("Giving up on block at offset {offset} after {attempt} attempts: {last}");
                return Err(TransferError::BlockFailed {
                    offset,
                    attempts: attempt,
                    last,
                });
            }
            warn!(
                "Retrying block at offset {offset} (attempt {attempt}/{}): {last}",
                self.policy.max_attempts
            );
        }
    }
}

impl Iterator for FileDownload<'_> {
    type Item = Result<Block, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.is_complete() {
            return None;
        }

        let result = self.fetch_block();
        if result.is_err() {
            self.failed = true;
        } else if self.is_complete() {
            info!("Downloaded {}", self.session.handle.name);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::protocol::parse_file_block_request;
    use crate::sim::SimulatedDevice;
    use std::sync::Arc;

    const POLICY: TransferPolicy = TransferPolicy {
        block_timeout: Duration::from_millis(100),
        max_attempts: 3,
    };

    fn contents(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Serves `data`, ignoring the first `drops` requests for the block at `flaky_offset`.
    fn file_device(data: Vec<u8>, flaky_offset: u32, drops: u32) -> SimulatedDevice {
        let mut dropped = 0;
        SimulatedDevice::new(move |req| {
            let (_, offset, length) = parse_file_block_request(&req.payload).unwrap();
            if offset == flaky_offset && dropped < drops {
                dropped += 1;
                return vec![];
            }
            let start = offset as usize;
            let end = (start + length as usize).min(data.len());
            vec![Frame::new(req.command, req.sequence, data[start..end].to_vec())]
        })
    }

    fn handle(total_size: u32, block_size: u32) -> FileHandle {
        FileHandle {
            name: "rec.hda".into(),
            total_size,
            block_size,
        }
    }

    #[test]
    fn issues_ceil_blocks_and_returns_exact_size() {
        let data = contents(1025);
        let device = file_device(data.clone(), u32::MAX, 0);
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();

        let download = FileDownload::new(&dispatcher, handle(1025, 256), POLICY).unwrap();
        let received = download.collect_bytes(|_, _| {}).unwrap();
        assert_eq!(received, data);

        let requests: Vec<_> = device
            .written()
            .iter()
            .map(|f| parse_file_block_request(&f.payload).unwrap())
            .collect();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[4], ("rec.hda".into(), 1024, 1));
    }

    #[test]
    fn block_recovers_on_third_attempt() {
        let data = contents(300);
        let device = file_device(data.clone(), 100, 2);
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();

        let download = FileDownload::new(&dispatcher, handle(300, 100), POLICY).unwrap();
        assert_eq!(download.collect_bytes(|_, _| {}).unwrap(), data);
        assert_eq!(device.written().len(), 5);
    }

    #[test]
    fn block_fails_after_three_attempts() {
        let device = file_device(contents(300), 200, 3);
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();

        let mut download = FileDownload::new(&dispatcher, handle(300, 100), POLICY).unwrap();
        assert!(download.next().unwrap().is_ok());
        assert!(download.next().unwrap().is_ok());
        match download.next().unwrap() {
            Err(TransferError::BlockFailed {
                offset, attempts, ..
            }) => {
                assert_eq!(offset, 200);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(download.next().is_none());
        assert_eq!(download.offset(), 200);
    }

    #[test]
    fn short_block_is_retried() {
        let mut calls = 0;
        let device = SimulatedDevice::new(move |req| {
            calls += 1;
            let payload = if calls == 1 { vec![0; 10] } else { vec![0; 50] };
            vec![Frame::new(req.command, req.sequence, payload)]
        });
        let dispatcher = Dispatcher::start(Arc::new(device)).unwrap();

        let download = FileDownload::new(&dispatcher, handle(50, 100), POLICY).unwrap();
        assert_eq!(download.collect_bytes(|_, _| {}).unwrap().len(), 50);
    }

    #[test]
    fn resume_starts_at_offset() {
        let data = contents(250);
        let device = file_device(data.clone(), u32::MAX, 0);
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();

        let download = FileDownload::resume(&dispatcher, handle(250, 100), 200, POLICY).unwrap();
        let mut progress = vec![];
        let tail = download.collect_bytes(|n, t| progress.push((n, t))).unwrap();
        assert_eq!(tail, &data[200..]);
        assert_eq!(progress, [(250, 250)]);

        assert!(matches!(
            FileDownload::resume(&dispatcher, handle(250, 100), 251, POLICY),
            Err(TransferError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn empty_file_needs_no_requests() {
        let device = SimulatedDevice::silent();
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();

        let download = FileDownload::new(&dispatcher, handle(0, 100), POLICY).unwrap();
        assert!(download.collect_bytes(|_, _| {}).unwrap().is_empty());
        assert!(device.written().is_empty());
    }

    #[test]
    fn lost_device_aborts_without_retry() {
        let device = SimulatedDevice::silent();
        let dispatcher = Dispatcher::start(Arc::new(device.clone())).unwrap();
        device.unplug();

        let mut download = FileDownload::new(&dispatcher, handle(10, 100), POLICY).unwrap();
        assert!(matches!(
            download.next(),
            Some(Err(TransferError::Aborted { offset: 0, .. }))
        ));
    }
}
