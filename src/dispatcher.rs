use crate::frame::{self, CommandCode, CommandId, EncodeError, Frame, FrameAssembler};
use crate::transport::{Transport, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest single bulk read the background reader asks for.
const READ_CHUNK: usize = 64 * 1024;

/// How long one transport read, or one wait for queued writes, may block. Bounds how quickly
/// the worker threads notice shutdown. A frame whose bytes stop arriving for this long is
/// abandoned.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failures of a single request/response exchange.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("no response to {command} #{sequence} within {timeout:?}")]
    Timeout {
        command: CommandId,
        sequence: u32,
        timeout: Duration,
    },

    #[error("request could not be framed")]
    Encode(#[from] EncodeError),

    #[error("transport failure")]
    Transport(#[from] TransportError),

    #[error("could not start the {thread} thread")]
    Spawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DispatchError {
    /// Timeouts and cleared stalls leave the session healthy; callers may retry them.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DispatchError::Timeout { .. } => true,
            DispatchError::Transport(e) => !e.is_fatal(),
            _ => false,
        }
    }
}

type ReplySlot = Sender<Result<Frame, DispatchError>>;

struct PendingRequest {
    command: CommandId,
    issued_at: Instant,
    deadline: Option<Instant>,
    reply: ReplySlot,
}

struct PendingTable {
    next_sequence: u32,
    requests: HashMap<u32, PendingRequest>,
}

impl PendingTable {
    fn new(first_sequence: u32) -> Self {
        Self {
            next_sequence: first_sequence,
            requests: HashMap::new(),
        }
    }

    /// Next sequence number not used by any in-flight request. Wraps at `u32::MAX`.
    fn allocate(&mut self) -> u32 {
        loop {
            let sequence = self.next_sequence;
            self.next_sequence = sequence.wrapping_add(1);
            if !self.requests.contains_key(&sequence) {
                return sequence;
            }
        }
    }
}

/// One encoded request waiting for the writer thread.
struct WriteJob {
    command: CommandId,
    sequence: u32,
    bytes: Vec<u8>,
    done: Sender<Result<(), TransportError>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    pending: Mutex<PendingTable>,
    shutdown: AtomicBool,
    lost: AtomicBool,
}

impl Shared {
    /// Hand a received frame to whoever is waiting for its sequence number.
    fn route(&self, frame: Frame) {
        let mut table = self.pending.lock();
        match table.requests.remove(&frame.sequence) {
            Some(request) if CommandCode::from(request.command) == frame.command => {
                let now = Instant::now();
                if request.deadline.is_some_and(|d| now > d) {
                    debug!("{} #{} answered after its deadline", frame.command, frame.sequence);
                }
                trace!(
                    "{} #{} answered in {:?} ({} bytes)",
                    frame.command,
                    frame.sequence,
                    now - request.issued_at,
                    frame.len()
                );
                // The waiter may have given up in the meantime; nothing to do then.
                let _ = request.reply.try_send(Ok(frame));
            }
            Some(request) => {
                warn!(
                    "Dropping {} #{}: sequence belongs to pending {}",
                    frame.command, frame.sequence, request.command
                );
                table.requests.insert(frame.sequence, request);
            }
            None => {
                warn!(
                    "Dropping {} #{}: no request is waiting for it",
                    frame.command, frame.sequence
                );
            }
        }
    }

    /// Mark the link dead and wake every waiter with `cause`.
    fn fail_all(&self, cause: TransportError) {
        self.lost.store(true, Ordering::Release);
        let drained: Vec<_> = self.pending.lock().requests.drain().collect();
        for (sequence, request) in drained {
            debug!("Failing {} #{sequence}: {cause}", request.command);
            let _ = request.reply.try_send(Err(cause.clone().into()));
        }
    }

    fn forget(&self, sequence: u32) -> bool {
        self.pending.lock().requests.remove(&sequence).is_some()
    }
}

fn route_frames(shared: &Shared, assembler: &mut FrameAssembler) {
    while let Some(result) = assembler.next_frame() {
        match result {
            Ok(frame) => shared.route(frame),
            Err(e) => warn!("Dropping malformed frame: {e}"),
        }
    }
}

fn read_loop(shared: Arc<Shared>) {
    let mut assembler = FrameAssembler::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        match shared.transport.read(READ_CHUNK, POLL_INTERVAL) {
            Ok(bytes) => {
                assembler.push(&bytes);
                route_frames(&shared, &mut assembler);
            }
            Err(TransportError::Timeout) => {
                // A header whose payload never follows would otherwise swallow every later
                // reply.
                if assembler.buffered_len() > 0 {
                    let dropped = assembler.discard_partial();
                    warn!("Abandoning incomplete frame ({dropped} bytes buffered)");
                    route_frames(&shared, &mut assembler);
                }
            }
            Err(e) if !e.is_fatal() => warn!("Response read failed, retrying: {e}"),
            Err(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    error!("Response reader stopped: {e}");
                }
                shared.fail_all(e);
                break;
            }
        }
    }

    trace!("Response reader exiting");
}

/// Drains the write queue in arrival order, so at most one write is ever on the transport.
fn write_loop(shared: Arc<Shared>, jobs: Receiver<WriteJob>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match jobs.recv_timeout(POLL_INTERVAL) {
            Ok(job) => {
                trace!(
                    "Writing {} #{} ({} bytes)",
                    job.command,
                    job.sequence,
                    job.bytes.len()
                );
                let result = shared.transport.write(&job.bytes);
                if let Err(e) = &result {
                    if e.is_fatal() {
                        error!("Write of {} #{} failed: {e}", job.command, job.sequence);
                        shared.fail_all(e.clone());
                    }
                }
                let _ = job.done.send(result);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Jobs still queued are dropped with the receiver; their callers see NotConnected.
    trace!("Request writer exiting");
}

fn spawn_worker(
    thread: &'static str,
    work: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, DispatchError> {
    std::thread::Builder::new()
        .name(thread.into())
        .spawn(work)
        .map_err(|source| DispatchError::Spawn { thread, source })
}

/// Correlates requests with responses over one transport.
///
/// Requests are queued to a single writer thread and go out one at a time in the order callers
/// arrive. A background thread reads continuously and routes each response to the caller
/// holding the same sequence number, so responses may arrive in any order.
pub struct Dispatcher {
    shared: Arc<Shared>,
    jobs: Sender<WriteJob>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(transport: Arc<dyn Transport>) -> Result<Self, DispatchError> {
        Self::start_at(transport, 0)
    }

    pub(crate) fn start_at(
        transport: Arc<dyn Transport>,
        first_sequence: u32,
    ) -> Result<Self, DispatchError> {
        let shared = Arc::new(Shared {
            transport,
            pending: Mutex::new(PendingTable::new(first_sequence)),
            shutdown: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });
        let (jobs, queue) = unbounded();

        let mut dispatcher = Self {
            shared: Arc::clone(&shared),
            jobs,
            workers: Vec::with_capacity(2),
        };

        let reader_shared = Arc::clone(&shared);
        dispatcher
            .workers
            .push(spawn_worker("hidock-reader", move || read_loop(reader_shared))?);
        // On failure here, dropping the dispatcher stops the reader again.
        dispatcher
            .workers
            .push(spawn_worker("hidock-writer", move || write_loop(shared, queue))?);

        Ok(dispatcher)
    }

    /// Send a request and wait up to `timeout` for its response.
    pub fn send(
        &self,
        command: CommandId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, DispatchError> {
        self.begin(command, payload, timeout)?.wait()
    }

    /// Write a request and return a handle for its response. Dropping the handle cancels the
    /// request: a response arriving later is discarded.
    pub fn begin(
        &self,
        command: CommandId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PendingReply<'_>, DispatchError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected.into());
        }

        // Registered before the write so an immediate answer finds its waiter.
        let (reply_tx, reply_rx) = bounded(1);
        let (sequence, bytes) = {
            let mut table = self.shared.pending.lock();
            let sequence = table.allocate();
            let bytes = frame::encode(command, sequence, payload)?;
            table.requests.insert(
                sequence,
                PendingRequest {
                    command,
                    issued_at: Instant::now(),
                    deadline: None,
                    reply: reply_tx,
                },
            );
            (sequence, bytes)
        };

        let mut reply = PendingReply {
            shared: &self.shared,
            command,
            sequence,
            timeout,
            // Replaced once the frame is on the wire.
            deadline: Instant::now() + timeout,
            rx: reply_rx,
            settled: false,
        };

        debug!("Sending {command} #{sequence} ({} byte payload)", payload.len());
        let (done_tx, done_rx) = bounded(1);
        let job = WriteJob {
            command,
            sequence,
            bytes,
            done: done_tx,
        };
        if self.jobs.send(job).is_err() {
            return Err(TransportError::NotConnected.into());
        }
        match done_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::NotConnected.into()),
        }

        let deadline = Instant::now() + timeout;
        reply.deadline = deadline;
        if let Some(request) = self.shared.pending.lock().requests.get_mut(&sequence) {
            request.deadline = Some(deadline);
        }

        Ok(reply)
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().requests.len()
    }

    /// False once the transport has failed or the dispatcher has shut down.
    pub fn is_alive(&self) -> bool {
        !self.shared.lost.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the worker threads and release the transport. Outstanding requests fail with
    /// [TransportError::NotConnected].
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.transport.disconnect();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Dispatcher worker panicked");
            }
        }
        self.shared.fail_all(TransportError::NotConnected);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An in-flight request. Obtained from [Dispatcher::begin].
pub struct PendingReply<'a> {
    shared: &'a Shared,
    command: CommandId,
    sequence: u32,
    timeout: Duration,
    deadline: Instant,
    rx: Receiver<Result<Frame, DispatchError>>,
    settled: bool,
}

impl PendingReply<'_> {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Block until the response arrives or the deadline passes.
    pub fn wait(mut self) -> Result<Frame, DispatchError> {
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                break;
            }
            match self.rx.recv_timeout(self.deadline - now) {
                Ok(result) => {
                    self.settled = true;
                    return result;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.settled = true;
                    return Err(TransportError::NotConnected.into());
                }
            }
        }

        // The response may have been routed between the last poll and now.
        self.shared.forget(self.sequence);
        self.settled = true;
        if let Ok(result) = self.rx.try_recv() {
            return result;
        }

        debug!("{} #{} timed out", self.command, self.sequence);
        Err(DispatchError::Timeout {
            command: self.command,
            sequence: self.sequence,
            timeout: self.timeout,
        })
    }

    /// Stop waiting. The frame has already been written, so the device may still answer; that
    /// answer is dropped by the reader.
    pub fn cancel(self) {
        debug!("Cancelling {} #{}", self.command, self.sequence);
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.forget(self.sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PAYLOAD;
    use crate::sim::SimulatedDevice;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    fn echo() -> SimulatedDevice {
        SimulatedDevice::new(|req| vec![Frame::new(req.command, req.sequence, req.payload.clone())])
    }

    fn start(device: &SimulatedDevice) -> Dispatcher {
        Dispatcher::start(Arc::new(device.clone())).unwrap()
    }

    #[test]
    fn response_is_returned_to_sender() {
        let device = echo();
        let dispatcher = start(&device);

        let frame = dispatcher
            .send(CommandId::GET_SETTINGS, &[1, 2, 3], LONG)
            .unwrap();
        assert_eq!(frame.payload, [1, 2, 3]);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn permuted_responses_reach_original_callers() {
        const CALLERS: usize = 6;
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS as u8)
                .map(|i| {
                    let dispatcher = &dispatcher;
                    s.spawn(move || {
                        let frame = dispatcher.send(CommandId::GET_CARD_INFO, &[i], LONG).unwrap();
                        assert_eq!(frame.payload, [i, 0xee]);
                    })
                })
                .collect();

            assert!(device.wait_for_writes(CALLERS, LONG));
            let mut written = device.written();
            // Answer in a scrambled order.
            written.reverse();
            written.swap(0, 3);
            for req in written {
                let mut payload = req.payload.clone();
                payload.push(0xee);
                device.reply(&Frame::new(req.command, req.sequence, payload));
            }

            for handle in handles {
                handle.join().unwrap();
            }
        });

        let mut sequences: Vec<_> = device.written().iter().map(|f| f.sequence).collect();
        sequences.sort();
        sequences.dedup();
        assert_eq!(sequences.len(), CALLERS);
    }

    #[test]
    fn timeout_fires_no_earlier_than_requested() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let started = Instant::now();
        let err = dispatcher
            .send(CommandId::GET_DEVICE_TIME, &[], SHORT)
            .unwrap_err();
        assert!(started.elapsed() >= SHORT);
        assert!(matches!(
            err,
            DispatchError::Timeout {
                command: CommandId::GET_DEVICE_TIME,
                ..
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn late_response_is_dropped() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let first = dispatcher.begin(CommandId::GET_SETTINGS, &[], SHORT).unwrap();
        let late_sequence = first.sequence();
        assert!(first.wait().is_err());

        let second = dispatcher.begin(CommandId::GET_SETTINGS, &[], LONG).unwrap();
        device.reply(&Frame::new(CommandId::GET_SETTINGS, late_sequence, vec![0xaa]));
        device.reply(&Frame::new(CommandId::GET_SETTINGS, second.sequence(), vec![0xbb]));
        assert_eq!(second.wait().unwrap().payload, [0xbb]);
    }

    #[test]
    fn malformed_frame_does_not_fail_pending_request() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let pending = dispatcher.begin(CommandId::GET_CARD_INFO, &[], LONG).unwrap();
        let mut garbage =
            frame::encode(CommandId::GET_CARD_INFO, pending.sequence(), &[]).unwrap();
        garbage[8..12].copy_from_slice(&0x00ff_ffffu32.to_be_bytes());
        device.inject(garbage);
        device.reply(&Frame::new(CommandId::GET_CARD_INFO, pending.sequence(), vec![7]));

        assert_eq!(pending.wait().unwrap().payload, [7]);
    }

    #[test]
    fn mismatched_command_is_not_delivered() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let pending = dispatcher.begin(CommandId::GET_SETTINGS, &[], SHORT).unwrap();
        device.reply(&Frame::new(CommandId::GET_CARD_INFO, pending.sequence(), vec![1]));
        assert!(matches!(pending.wait(), Err(DispatchError::Timeout { .. })));
    }

    #[test]
    fn unplug_fails_waiters_and_later_sends() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let pending = dispatcher.begin(CommandId::GET_FILE_LIST, &[], LONG).unwrap();
        device.unplug();
        assert!(matches!(
            pending.wait(),
            Err(DispatchError::Transport(TransportError::DeviceLost))
        ));
        assert!(!dispatcher.is_alive());
        assert!(matches!(
            dispatcher.send(CommandId::GET_DEVICE_INFO, &[], LONG),
            Err(DispatchError::Transport(TransportError::NotConnected))
        ));
    }

    #[test]
    fn cancelled_request_is_forgotten() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let pending = dispatcher.begin(CommandId::GET_FILE_LIST, &[], LONG).unwrap();
        let sequence = pending.sequence();
        assert_eq!(dispatcher.in_flight(), 1);
        pending.cancel();
        assert_eq!(dispatcher.in_flight(), 0);

        // The answer to the cancelled request goes nowhere; the next request still works.
        device.reply(&Frame::new(CommandId::GET_FILE_LIST, sequence, vec![]));
        let next = dispatcher.begin(CommandId::GET_FILE_LIST, &[], LONG).unwrap();
        device.reply(&Frame::new(CommandId::GET_FILE_LIST, next.sequence(), vec![5]));
        assert_eq!(next.wait().unwrap().payload, [5]);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let device = echo();
        let dispatcher = Dispatcher::start_at(Arc::new(device.clone()), u32::MAX).unwrap();

        dispatcher.send(CommandId::GET_DEVICE_INFO, &[], LONG).unwrap();
        dispatcher.send(CommandId::GET_DEVICE_INFO, &[], LONG).unwrap();
        let sequences: Vec<_> = device.written().iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, [u32::MAX, 0]);
    }

    #[test]
    fn allocation_skips_in_flight_sequences() {
        let mut table = PendingTable::new(u32::MAX);
        let (tx, _rx) = bounded(1);
        table.requests.insert(
            0,
            PendingRequest {
                command: CommandId::GET_DEVICE_INFO,
                issued_at: Instant::now(),
                deadline: None,
                reply: tx,
            },
        );
        assert_eq!(table.allocate(), u32::MAX);
        assert_eq!(table.allocate(), 1);
    }

    #[test]
    fn shutdown_releases_transport() {
        let device = echo();
        let mut dispatcher = start(&device);
        dispatcher.shutdown();
        assert!(!device.is_connected());
        assert!(!dispatcher.is_alive());
    }

    #[test]
    fn stalled_partial_frame_is_abandoned() {
        let device = SimulatedDevice::silent();
        let dispatcher = start(&device);

        let pending = dispatcher.begin(CommandId::GET_SETTINGS, &[], LONG).unwrap();
        // Valid header whose payload never arrives.
        let mut header = frame::encode(CommandId::GET_SETTINGS, 999, &[]).unwrap();
        header[8..12].copy_from_slice(&1000u32.to_be_bytes());
        device.inject(header);

        thread::sleep(POLL_INTERVAL + Duration::from_millis(50));
        device.reply(&Frame::new(CommandId::GET_SETTINGS, pending.sequence(), vec![3]));
        assert_eq!(pending.wait().unwrap().payload, [3]);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let device = echo();
        let dispatcher = start(&device);

        let payload = vec![0; MAX_PAYLOAD + 1];
        assert!(matches!(
            dispatcher.send(CommandId::FIRMWARE_UPLOAD, &payload, LONG),
            Err(DispatchError::Encode(EncodeError::Oversized { actual }))
                if actual == MAX_PAYLOAD + 1
        ));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(device.written().is_empty());
        assert!(dispatcher.is_alive());

        let payload = vec![0; MAX_PAYLOAD];
        let frame = dispatcher.send(CommandId::FIRMWARE_UPLOAD, &payload, LONG).unwrap();
        assert_eq!(frame.len(), MAX_PAYLOAD);
    }

    /// Records how many writers are inside `write` at once. The first write holds until the
    /// test releases it so later callers pile up behind it.
    struct GatedTransport {
        inside: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<u8>>,
        gate: Receiver<()>,
    }

    impl Transport for GatedTransport {
        fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let first = {
                let mut order = self.order.lock();
                let frame = frame::decode(bytes).unwrap();
                order.push(frame.payload[0]);
                order.len() == 1
            };
            if first {
                let _ = self.gate.recv_timeout(LONG);
            }
            thread::sleep(Duration::from_millis(2));

            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&self, _max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            thread::sleep(timeout);
            Err(TransportError::Timeout)
        }

        fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn writes_are_serialized_in_arrival_order() {
        const CALLERS: u8 = 5;
        let (release, gate) = bounded(1);
        let transport = Arc::new(GatedTransport {
            inside: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            order: Mutex::new(vec![]),
            gate,
        });
        let dispatcher = Dispatcher::start(transport.clone()).unwrap();

        thread::scope(|s| {
            for i in 0..CALLERS {
                let dispatcher = &dispatcher;
                s.spawn(move || {
                    let pending = dispatcher.begin(CommandId::GET_SETTINGS, &[i], SHORT).unwrap();
                    pending.cancel();
                });
                // Give each caller time to queue before the next one arrives.
                thread::sleep(Duration::from_millis(20));
            }
            release.send(()).unwrap();
        });

        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.order.lock(), (0..CALLERS).collect::<Vec<_>>());
    }
}
