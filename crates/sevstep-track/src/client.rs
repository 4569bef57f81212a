//! Command/event client for the page-fault tracker.
//!
//! [`TrackerClient`] owns one device handle, registers the calling process
//! on construction, and resets the tracker when it goes away.
//!
//! Two ways to collect faults:
//!
//! - **Single-event**: arm tracking, then [`poll_event`] and [`ack_event`]
//!   in a loop.  The guest vCPU stalls until each event is acked.
//! - **Batch**: [`batch_tracking_start`], let the guest run, then
//!   [`batch_tracking_stop_and_get`].  The tracker buffers events without
//!   waiting for acks.  The client keeps an explicit [`BatchState`] and
//!   refuses batch calls made out of order.
//!
//! [`poll_event`]: TrackerClient::poll_event
//! [`ack_event`]: TrackerClient::ack_event
//! [`batch_tracking_start`]: TrackerClient::batch_tracking_start
//! [`batch_tracking_stop_and_get`]: TrackerClient::batch_tracking_stop_and_get

use crate::device::{KvmTrackerDevice, TrackerDevice};
use crate::events::Event;
use log::{debug, info, warn};
use sevstep_protocol::{
    AckEvent, BatchTrackConfig, PageFaultRecord, RetiredInstrPerfConfig, TrackAllPagesParam,
    TrackMode, TrackPageParam, UserspaceCtx, NO_WBINVD_CPU, PAGE_FAULT_RECORD_SIZE,
    POLL_STATUS_GOT_EVENT, POLL_STATUS_NO_EVENT,
};
use std::cell::Cell;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Failed to open tracker device {}: {source}", path.display())]
    OpenDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("KVM_USPT_REGISTER_PID failed: {0}")]
    RegistrationFailed(#[source] io::Error),

    #[error("{op} failed: {source}")]
    TransportFailure {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} not allowed while {state}")]
    InvalidState { op: &'static str, state: BatchState },

    #[error("KVM_USPT_POLL_EVENT failed: unexpected status {0}")]
    UnexpectedPollStatus(i32),

    #[error("cpu {0} out of range")]
    InvalidCpu(u32),

    #[error("batch of {0} events does not fit in memory")]
    BatchTooLarge(u64),
}

fn transport(op: &'static str) -> impl FnOnce(io::Error) -> TrackerError {
    move |source| TrackerError::TransportFailure { op, source }
}

fn cpu_arg(cpu: u32) -> Result<i32, TrackerError> {
    i32::try_from(cpu).map_err(|_| TrackerError::InvalidCpu(cpu))
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Where the tracker lives and what to ask it for.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Device node exposing the tracker ioctls.
    pub device_path: PathBuf,
    /// Ask the tracker to resolve each fault's RIP.  Works for plain VMs and
    /// SEV-ES guests with the debug policy bit; expensive for the latter.
    pub want_rip: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::for_device("/dev/kvm")
    }
}

impl TrackerConfig {
    /// Config for a specific device node, RIP resolution off.
    pub fn for_device(path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: path.into(),
            want_rip: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Batch state machine
// ═══════════════════════════════════════════════════════════════════════

/// Where the client is in the batch protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Batching {
        mode: TrackMode,
        expected_events: u64,
        perf_cpu: u32,
        retrack: bool,
    },
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Idle => write!(f, "idle"),
            BatchState::Batching {
                mode,
                expected_events,
                ..
            } => write!(
                f,
                "batching ({} tracking, {expected_events} events expected)",
                mode.name()
            ),
        }
    }
}

/// Output of [`TrackerClient::batch_tracking_stop_and_get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub events: Vec<Event>,
    /// The tracker hit an internal error while batching; details are in
    /// the kernel log.
    pub error_during_batch: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Client
// ═══════════════════════════════════════════════════════════════════════

/// Owns the tracker handle.
///
/// Every command takes `&mut self`.  The client is `Send` but not `Sync`.
pub struct TrackerClient<D: TrackerDevice = KvmTrackerDevice> {
    device: D,
    want_rip: bool,
    batch: BatchState,
    torn_down: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl TrackerClient<KvmTrackerDevice> {
    /// Open the configured device node and register this process.
    pub fn open(config: &TrackerConfig) -> Result<Self, TrackerError> {
        let device = KvmTrackerDevice::open(&config.device_path).map_err(|source| {
            TrackerError::OpenDevice {
                path: config.device_path.clone(),
                source,
            }
        })?;
        info!("Opened tracker device {}", config.device_path.display());
        Self::with_device(device, config.want_rip)
    }
}

impl<D: TrackerDevice> TrackerClient<D> {
    /// Register this process on an already constructed transport.
    pub fn with_device(mut device: D, want_rip: bool) -> Result<Self, TrackerError> {
        let pid = std::process::id() as i32;
        device
            .register(&UserspaceCtx::new(pid, want_rip))
            .map_err(TrackerError::RegistrationFailed)?;
        info!("Registered pid {pid} with tracker (want_rip={want_rip})");

        Ok(Self {
            device,
            want_rip,
            batch: BatchState::Idle,
            torn_down: false,
            _not_sync: PhantomData,
        })
    }

    pub fn want_rip(&self) -> bool {
        self.want_rip
    }

    pub fn batch_state(&self) -> BatchState {
        self.batch
    }

    /// Clear all tracker state.  Idempotent.
    pub fn reset(&mut self) -> Result<(), TrackerError> {
        self.device.reset().map_err(transport("KVM_USPT_RESET"))?;
        self.batch = BatchState::Idle;
        debug!("Tracker reset");
        Ok(())
    }

    // ── Tracking ─────────────────────────────────────────────────────

    pub fn track_page(&mut self, gpa: u64, mode: TrackMode) -> Result<(), TrackerError> {
        self.device
            .track_page(&TrackPageParam::new(gpa, mode))
            .map_err(transport("KVM_TRACK_PAGE"))
    }

    pub fn track_all_pages(&mut self, mode: TrackMode) -> Result<(), TrackerError> {
        self.device
            .track_all(&TrackAllPagesParam::new(mode))
            .map_err(transport("KVM_USPT_TRACK_ALL"))
    }

    pub fn untrack_all_pages(&mut self, mode: TrackMode) -> Result<(), TrackerError> {
        self.device
            .untrack_all(&TrackAllPagesParam::new(mode))
            .map_err(transport("KVM_USPT_UNTRACK_ALL"))
    }

    // ── Single-event protocol ────────────────────────────────────────

    /// Fetch the pending event, if any.  Never blocks.
    ///
    /// Events from this path carry neither `monitor_gpa`/`content` nor a
    /// retired-instruction count.
    pub fn poll_event(&mut self) -> Result<Option<Event>, TrackerError> {
        let mut buf = [0u8; PAGE_FAULT_RECORD_SIZE];
        let status = self
            .device
            .poll_event(&mut buf)
            .map_err(transport("KVM_USPT_POLL_EVENT"))?;

        match status {
            POLL_STATUS_NO_EVENT => Ok(None),
            POLL_STATUS_GOT_EVENT => {
                let mut event = Event::from(&PageFaultRecord::from_bytes(&buf));
                event.have_retired_instructions = false;
                event.retired_instructions = 0;
                Ok(Some(event))
            }
            other => Err(TrackerError::UnexpectedPollStatus(other)),
        }
    }

    /// Release the vCPU stalled on event `id`.
    pub fn ack_event(&mut self, id: u64) -> Result<(), TrackerError> {
        self.device
            .ack_event(&AckEvent { id })
            .map_err(transport("KVM_USPT_ACK_EVENT"))
    }

    // ── Guest memory and perf ────────────────────────────────────────

    /// Read `size` bytes of guest memory at `gpa`.
    ///
    /// `wbinvd_cpu` flushes caches on that logical cpu first; `None` skips
    /// the flush.
    pub fn read_guest_memory(
        &mut self,
        gpa: u64,
        size: usize,
        decrypt_with_host_key: bool,
        wbinvd_cpu: Option<u32>,
    ) -> Result<Vec<u8>, TrackerError> {
        let wbinvd_cpu = match wbinvd_cpu {
            Some(cpu) => cpu_arg(cpu)?,
            None => NO_WBINVD_CPU,
        };
        let mut buf = vec![0u8; size];
        self.device
            .read_guest_memory(gpa, decrypt_with_host_key, wbinvd_cpu, &mut buf)
            .map_err(transport("KVM_READ_GUEST_MEMORY"))?;
        Ok(buf)
    }

    /// Program the guest retired-instruction counter on `cpu`.
    pub fn setup_retired_instr_perf(&mut self, cpu: u32) -> Result<(), TrackerError> {
        let config = RetiredInstrPerfConfig { cpu: cpu_arg(cpu)? };
        self.device
            .setup_retired_instr_perf(&config)
            .map_err(transport("KVM_USPT_SETUP_RETINSTR_PERF"))
    }

    /// Read the counter programmed by [`setup_retired_instr_perf`].
    ///
    /// [`setup_retired_instr_perf`]: Self::setup_retired_instr_perf
    pub fn read_retired_instr_perf(&mut self, cpu: u32) -> Result<u64, TrackerError> {
        let cpu = cpu_arg(cpu)?;
        self.device
            .read_retired_instr_perf(cpu)
            .map_err(transport("KVM_USPT_READ_RETINSTR_PERF"))
    }

    // ── Batch protocol ───────────────────────────────────────────────

    /// Idle → Batching.
    ///
    /// Tracking itself still has to be armed with [`track_page`] or
    /// [`track_all_pages`].  With `retrack`, the tracker re-applies `mode`
    /// to each faulted page.
    ///
    /// [`track_page`]: Self::track_page
    /// [`track_all_pages`]: Self::track_all_pages
    pub fn batch_tracking_start(
        &mut self,
        mode: TrackMode,
        expected_events: u64,
        perf_cpu: u32,
        retrack: bool,
    ) -> Result<(), TrackerError> {
        const OP: &str = "KVM_USPT_BATCH_TRACK_START";
        if self.batch != BatchState::Idle {
            return Err(TrackerError::InvalidState {
                op: OP,
                state: self.batch,
            });
        }

        let config = BatchTrackConfig::new(mode, expected_events, cpu_arg(perf_cpu)?, retrack);
        self.device.batch_start(&config).map_err(transport(OP))?;

        self.batch = BatchState::Batching {
            mode,
            expected_events,
            perf_cpu,
            retrack,
        };
        info!(
            "Batch tracking started: mode={}, expected={expected_events}, perf_cpu={perf_cpu}",
            mode.name()
        );
        Ok(())
    }

    /// Events buffered so far.  Only valid while batching.
    pub fn batch_tracking_event_count(&mut self) -> Result<u64, TrackerError> {
        const OP: &str = "KVM_USPT_BATCH_TRACK_EVENT_COUNT";
        if self.batch == BatchState::Idle {
            return Err(TrackerError::InvalidState {
                op: OP,
                state: self.batch,
            });
        }
        self.device.batch_event_count().map_err(transport(OP))
    }

    /// Batching → Idle, returning the first `event_count` buffered events.
    pub fn batch_tracking_stop_and_get(
        &mut self,
        event_count: u64,
    ) -> Result<BatchResult, TrackerError> {
        const OP: &str = "KVM_USPT_BATCH_TRACK_STOP";
        if self.batch == BatchState::Idle {
            return Err(TrackerError::InvalidState {
                op: OP,
                state: self.batch,
            });
        }

        let len = usize::try_from(event_count)
            .ok()
            .and_then(|n| n.checked_mul(PAGE_FAULT_RECORD_SIZE))
            .ok_or(TrackerError::BatchTooLarge(event_count))?;
        let mut buf = vec![0u8; len];
        let error_during_batch = self.device.batch_stop(&mut buf).map_err(transport(OP))?;
        self.batch = BatchState::Idle;

        let events: Vec<Event> = buf
            .chunks_exact(PAGE_FAULT_RECORD_SIZE)
            .filter_map(PageFaultRecord::decode)
            .map(|record| Event::from(&record))
            .collect();
        debug_assert_eq!(events.len() as u64, event_count);

        if error_during_batch {
            warn!("Tracker reported an error during batch tracking");
        }
        info!("Batch tracking stopped: {} events", events.len());

        Ok(BatchResult {
            events,
            error_during_batch,
        })
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Reset the tracker and release the handle.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(e) = self.reset() {
            warn!("Reset before close failed: {e}");
        }
    }
}

impl<D: TrackerDevice> Drop for TrackerClient<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: TrackerDevice> fmt::Debug for TrackerClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerClient")
            .field("want_rip", &self.want_rip)
            .field("batch", &self.batch)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use std::rc::Rc;

    /// Commands as seen by the fake device.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Cmd {
        Register { pid: i32, get_rip: bool },
        Reset,
        TrackPage { gpa: u64, mode: i32 },
        TrackAll(i32),
        UntrackAll(i32),
        Poll,
        Ack(u64),
        ReadMem { gpa: u64, len: usize, decrypt: bool, wbinvd_cpu: i32 },
        SetupPerf(i32),
        ReadPerf(i32),
        BatchStart { mode: i32, expected: u64, perf_cpu: i32, retrack: bool },
        BatchCount,
        BatchStop { records: usize },
    }

    #[derive(Default)]
    struct FakeState {
        log: Vec<Cmd>,
        polls: VecDeque<(i32, Option<PageFaultRecord>)>,
        batch_records: Vec<PageFaultRecord>,
        batch_error: bool,
        /// Ioctl names that return `EINVAL` once logged.
        failing: HashSet<&'static str>,
    }

    /// In-memory tracker.  The shared state outlives the client so tests
    /// can inspect what was sent after close/drop.
    #[derive(Clone, Default)]
    struct FakeDevice(Rc<RefCell<FakeState>>);

    fn refused() -> io::Error {
        io::Error::from_raw_os_error(libc::EINVAL)
    }

    impl FakeDevice {
        fn log(&self) -> Vec<Cmd> {
            self.0.borrow().log.clone()
        }

        fn push(&self, cmd: Cmd) {
            self.0.borrow_mut().log.push(cmd);
        }

        fn fail_on(&self, op: &'static str) {
            self.0.borrow_mut().failing.insert(op);
        }

        fn check(&self, op: &'static str) -> io::Result<()> {
            if self.0.borrow().failing.contains(op) {
                return Err(refused());
            }
            Ok(())
        }

        /// The kernel rejects modes outside the enum.
        fn check_mode(mode: i32) -> io::Result<()> {
            TrackMode::from_i32(mode).map(|_| ()).ok_or_else(refused)
        }
    }

    impl TrackerDevice for FakeDevice {
        fn register(&mut self, ctx: &UserspaceCtx) -> io::Result<()> {
            self.push(Cmd::Register {
                pid: ctx.pid,
                get_rip: ctx.get_rip != 0,
            });
            self.check("KVM_USPT_REGISTER_PID")
        }

        fn reset(&mut self) -> io::Result<()> {
            self.push(Cmd::Reset);
            self.check("KVM_USPT_RESET")
        }

        fn track_page(&mut self, param: &TrackPageParam) -> io::Result<()> {
            self.push(Cmd::TrackPage {
                gpa: param.gpa,
                mode: param.track_mode,
            });
            self.check("KVM_TRACK_PAGE")?;
            Self::check_mode(param.track_mode)
        }

        fn track_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()> {
            self.push(Cmd::TrackAll(param.track_mode));
            self.check("KVM_USPT_TRACK_ALL")?;
            Self::check_mode(param.track_mode)
        }

        fn untrack_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()> {
            self.push(Cmd::UntrackAll(param.track_mode));
            self.check("KVM_USPT_UNTRACK_ALL")?;
            Self::check_mode(param.track_mode)
        }

        fn poll_event(&mut self, out: &mut [u8; PAGE_FAULT_RECORD_SIZE]) -> io::Result<i32> {
            self.push(Cmd::Poll);
            self.check("KVM_USPT_POLL_EVENT")?;
            let next = self.0.borrow_mut().polls.pop_front();
            match next {
                Some((status, record)) => {
                    if let Some(record) = record {
                        record.encode(out);
                    }
                    Ok(status)
                }
                None => Ok(POLL_STATUS_NO_EVENT),
            }
        }

        fn ack_event(&mut self, ack: &AckEvent) -> io::Result<()> {
            self.push(Cmd::Ack(ack.id));
            self.check("KVM_USPT_ACK_EVENT")
        }

        fn read_guest_memory(
            &mut self,
            gpa: u64,
            decrypt_with_host_key: bool,
            wbinvd_cpu: i32,
            out: &mut [u8],
        ) -> io::Result<()> {
            self.push(Cmd::ReadMem {
                gpa,
                len: out.len(),
                decrypt: decrypt_with_host_key,
                wbinvd_cpu,
            });
            self.check("KVM_READ_GUEST_MEMORY")?;
            for (i, b) in out.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }

        fn setup_retired_instr_perf(&mut self, config: &RetiredInstrPerfConfig) -> io::Result<()> {
            self.push(Cmd::SetupPerf(config.cpu));
            self.check("KVM_USPT_SETUP_RETINSTR_PERF")
        }

        fn read_retired_instr_perf(&mut self, cpu: i32) -> io::Result<u64> {
            self.push(Cmd::ReadPerf(cpu));
            self.check("KVM_USPT_READ_RETINSTR_PERF")?;
            Ok(123_456)
        }

        fn batch_start(&mut self, config: &BatchTrackConfig) -> io::Result<()> {
            self.push(Cmd::BatchStart {
                mode: config.tracking_type,
                expected: config.expected_events,
                perf_cpu: config.perf_cpu,
                retrack: config.retrack != 0,
            });
            self.check("KVM_USPT_BATCH_TRACK_START")?;
            Self::check_mode(config.tracking_type)
        }

        fn batch_event_count(&mut self) -> io::Result<u64> {
            self.push(Cmd::BatchCount);
            self.check("KVM_USPT_BATCH_TRACK_EVENT_COUNT")?;
            Ok(self.0.borrow().batch_records.len() as u64)
        }

        fn batch_stop(&mut self, out: &mut [u8]) -> io::Result<bool> {
            let records = out.len() / PAGE_FAULT_RECORD_SIZE;
            self.push(Cmd::BatchStop { records });
            self.check("KVM_USPT_BATCH_TRACK_STOP")?;
            let state = self.0.borrow();
            for (chunk, record) in out
                .chunks_exact_mut(PAGE_FAULT_RECORD_SIZE)
                .zip(state.batch_records.iter())
            {
                record.encode(chunk);
            }
            Ok(state.batch_error)
        }
    }

    fn client() -> (TrackerClient<FakeDevice>, FakeDevice) {
        let dev = FakeDevice::default();
        let client = TrackerClient::with_device(dev.clone(), true).unwrap();
        (client, dev)
    }

    fn record(id: u64) -> PageFaultRecord {
        PageFaultRecord {
            id,
            faulted_gpa: 0x3ac0_6000 + id * 0x1000,
            error_code: 0x14,
            have_rip_info: true,
            rip: 0x7ff1000,
            ns_timestamp: 1_650_000_000_000_000_000 + id,
            have_retired_instructions: true,
            retired_instructions: 1000 + id,
        }
    }

    // ── Construction and teardown ────────────────────────────────────

    #[test]
    fn construction_registers_current_pid() {
        let (client, dev) = client();
        assert!(client.want_rip());
        assert_eq!(
            dev.log(),
            vec![Cmd::Register {
                pid: std::process::id() as i32,
                get_rip: true
            }]
        );
    }

    #[test]
    fn registration_failure() {
        let dev = FakeDevice::default();
        dev.fail_on("KVM_USPT_REGISTER_PID");
        let err = TrackerClient::with_device(dev, false).unwrap_err();
        assert!(matches!(err, TrackerError::RegistrationFailed(_)));
    }

    #[test]
    fn close_resets_exactly_once() {
        let (client, dev) = client();
        client.close();
        let resets = dev.log().iter().filter(|c| **c == Cmd::Reset).count();
        assert_eq!(resets, 1);
        assert_eq!(dev.log().last(), Some(&Cmd::Reset));
    }

    #[test]
    fn drop_without_close_resets() {
        let (client, dev) = client();
        drop(client);
        assert_eq!(dev.log().last(), Some(&Cmd::Reset));
        assert_eq!(dev.log().len(), 2);
    }

    #[test]
    fn failed_teardown_reset_is_not_fatal() {
        let (client, dev) = client();
        dev.fail_on("KVM_USPT_RESET");
        client.close();
        assert_eq!(dev.log().iter().filter(|c| **c == Cmd::Reset).count(), 1);
    }

    #[test]
    fn open_missing_device() {
        let config = TrackerConfig::for_device("/nonexistent/kvm");
        match TrackerClient::open(&config) {
            Err(TrackerError::OpenDevice { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/kvm"))
            }
            other => panic!("expected OpenDevice, got {other:?}"),
        }
    }

    #[test]
    fn default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/kvm"));
        assert!(!config.want_rip);
    }

    // ── Single-event protocol ────────────────────────────────────────

    #[test]
    fn poll_without_event() {
        let (mut client, _dev) = client();
        assert_eq!(client.poll_event().unwrap(), None);
    }

    #[test]
    fn poll_with_event_drops_perf_data() {
        let (mut client, dev) = client();
        dev.0
            .borrow_mut()
            .polls
            .push_back((POLL_STATUS_GOT_EVENT, Some(record(7))));

        let event = client.poll_event().unwrap().unwrap();
        assert_eq!(event.id, 7);
        assert_eq!(event.faulted_gpa, 0x3ac0_d000);
        assert_eq!(event.rip(), Some(0x7ff1000));
        assert_eq!(event.retired_instructions(), None);
        assert!(!event.has_access_data());
        assert_eq!(
            event.timestamp.timestamp_nanos_opt(),
            Some(1_650_000_000_000_000_007)
        );

        client.ack_event(event.id).unwrap();
        assert_eq!(dev.log().last(), Some(&Cmd::Ack(7)));
    }

    #[test]
    fn poll_unexpected_status() {
        let (mut client, dev) = client();
        dev.0.borrow_mut().polls.push_back((7, None));
        assert!(matches!(
            client.poll_event(),
            Err(TrackerError::UnexpectedPollStatus(7))
        ));
    }

    #[test]
    fn tracking_commands_carry_mode() {
        let (mut client, dev) = client();
        client.track_page(0x3badb000, TrackMode::Exec).unwrap();
        client.track_all_pages(TrackMode::Access).unwrap();
        client.untrack_all_pages(TrackMode::Access).unwrap();
        assert_eq!(
            dev.log()[1..],
            [
                Cmd::TrackPage {
                    gpa: 0x3badb000,
                    mode: 3
                },
                Cmd::TrackAll(1),
                Cmd::UntrackAll(1),
            ]
        );
    }

    // ── Guest memory and perf ────────────────────────────────────────

    #[test]
    fn read_guest_memory_fills_buffer() {
        let (mut client, dev) = client();
        let bytes = client.read_guest_memory(0x1000, 16, true, None).unwrap();
        assert_eq!(bytes, (0u8..16).collect::<Vec<_>>());
        assert_eq!(
            dev.log().last(),
            Some(&Cmd::ReadMem {
                gpa: 0x1000,
                len: 16,
                decrypt: true,
                wbinvd_cpu: -1
            })
        );

        client.read_guest_memory(0x2000, 4, false, Some(3)).unwrap();
        assert!(matches!(
            dev.log().last(),
            Some(Cmd::ReadMem { wbinvd_cpu: 3, .. })
        ));
    }

    #[test]
    fn cpu_out_of_range_never_reaches_device() {
        let (mut client, dev) = client();
        let before = dev.log().len();
        assert!(matches!(
            client.read_guest_memory(0, 8, false, Some(u32::MAX)),
            Err(TrackerError::InvalidCpu(u32::MAX))
        ));
        assert!(matches!(
            client.setup_retired_instr_perf(1 << 31),
            Err(TrackerError::InvalidCpu(_))
        ));
        assert_eq!(dev.log().len(), before);
    }

    #[test]
    fn perf_counter() {
        let (mut client, dev) = client();
        client.setup_retired_instr_perf(2).unwrap();
        assert_eq!(client.read_retired_instr_perf(2).unwrap(), 123_456);
        assert_eq!(dev.log()[1..], [Cmd::SetupPerf(2), Cmd::ReadPerf(2)]);
    }

    // ── Batch protocol ───────────────────────────────────────────────

    #[test]
    fn batch_happy_path() {
        let (mut client, dev) = client();
        dev.0.borrow_mut().batch_records = (1..=3).map(record).collect();

        client
            .batch_tracking_start(TrackMode::Access, 100, 2, true)
            .unwrap();
        assert_eq!(
            client.batch_state(),
            BatchState::Batching {
                mode: TrackMode::Access,
                expected_events: 100,
                perf_cpu: 2,
                retrack: true
            }
        );

        let count = client.batch_tracking_event_count().unwrap();
        assert_eq!(count, 3);

        let result = client.batch_tracking_stop_and_get(count).unwrap();
        assert_eq!(client.batch_state(), BatchState::Idle);
        assert!(!result.error_during_batch);
        let ids: Vec<u64> = result.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(result.events[1].retired_instructions(), Some(1002));

        assert!(dev.log().contains(&Cmd::BatchStart {
            mode: 1,
            expected: 100,
            perf_cpu: 2,
            retrack: true
        }));
        assert_eq!(dev.log().last(), Some(&Cmd::BatchStop { records: 3 }));
    }

    #[test]
    fn batch_reports_tracker_error() {
        let (mut client, dev) = client();
        dev.0.borrow_mut().batch_error = true;
        client
            .batch_tracking_start(TrackMode::Write, 1, 0, false)
            .unwrap();
        let result = client.batch_tracking_stop_and_get(0).unwrap();
        assert!(result.error_during_batch);
        assert!(result.events.is_empty());
    }

    #[test]
    fn stop_while_idle_is_invalid_state() {
        let (mut client, dev) = client();
        let before = dev.log();
        assert!(matches!(
            client.batch_tracking_stop_and_get(1),
            Err(TrackerError::InvalidState {
                state: BatchState::Idle,
                ..
            })
        ));
        assert!(matches!(
            client.batch_tracking_event_count(),
            Err(TrackerError::InvalidState { .. })
        ));
        assert_eq!(dev.log(), before);
    }

    #[test]
    fn second_start_is_invalid_state() {
        let (mut client, dev) = client();
        client
            .batch_tracking_start(TrackMode::Exec, 10, 1, false)
            .unwrap();
        let before = dev.log();
        let err = client
            .batch_tracking_start(TrackMode::Exec, 10, 1, false)
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState { .. }));
        assert!(err.to_string().contains("batching"), "{err}");
        assert_eq!(dev.log(), before);
    }

    #[test]
    fn failed_start_stays_idle() {
        let (mut client, dev) = client();
        dev.fail_on("KVM_USPT_BATCH_TRACK_START");
        let err = client
            .batch_tracking_start(TrackMode::Access, 10, 0, false)
            .unwrap_err();
        match err {
            TrackerError::TransportFailure { op, .. } => {
                assert_eq!(op, "KVM_USPT_BATCH_TRACK_START")
            }
            other => panic!("expected TransportFailure, got {other:?}"),
        }
        assert_eq!(client.batch_state(), BatchState::Idle);
    }

    #[test]
    fn failed_stop_stays_batching() {
        let (mut client, dev) = client();
        client
            .batch_tracking_start(TrackMode::Access, 10, 0, false)
            .unwrap();
        dev.fail_on("KVM_USPT_BATCH_TRACK_STOP");
        assert!(client.batch_tracking_stop_and_get(2).is_err());
        assert!(matches!(client.batch_state(), BatchState::Batching { .. }));
    }

    #[test]
    fn oversized_stop_is_rejected_before_the_device() {
        let (mut client, dev) = client();
        client
            .batch_tracking_start(TrackMode::Access, 10, 0, false)
            .unwrap();
        let before = dev.log();
        let err = client.batch_tracking_stop_and_get(u64::MAX).unwrap_err();
        assert!(matches!(err, TrackerError::BatchTooLarge(u64::MAX)), "{err:?}");
        assert_eq!(dev.log(), before);
        assert!(matches!(client.batch_state(), BatchState::Batching { .. }));
    }

    // ── Transport errors ─────────────────────────────────────────────

    fn failed_op<T: std::fmt::Debug>(result: Result<T, TrackerError>) -> &'static str {
        match result {
            Err(TrackerError::TransportFailure { op, source }) => {
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
                op
            }
            other => panic!("expected TransportFailure, got {other:?}"),
        }
    }

    #[test]
    fn transport_failures_name_their_ioctl() {
        type Call = fn(&mut TrackerClient<FakeDevice>) -> Result<(), TrackerError>;
        let cases: [(&str, Call); 9] = [
            ("KVM_TRACK_PAGE", |c| c.track_page(0x1000, TrackMode::Write)),
            ("KVM_USPT_TRACK_ALL", |c| c.track_all_pages(TrackMode::Access)),
            ("KVM_USPT_UNTRACK_ALL", |c| c.untrack_all_pages(TrackMode::Access)),
            ("KVM_USPT_POLL_EVENT", |c| c.poll_event().map(drop)),
            ("KVM_USPT_ACK_EVENT", |c| c.ack_event(3)),
            ("KVM_READ_GUEST_MEMORY", |c| {
                c.read_guest_memory(0x1000, 16, false, None).map(drop)
            }),
            ("KVM_USPT_SETUP_RETINSTR_PERF", |c| c.setup_retired_instr_perf(1)),
            ("KVM_USPT_READ_RETINSTR_PERF", |c| c.read_retired_instr_perf(1).map(drop)),
            ("KVM_USPT_RESET", |c| c.reset()),
        ];

        for (op, call) in cases {
            let (mut client, dev) = client();
            dev.fail_on(op);
            assert_eq!(failed_op(call(&mut client)), op);
        }
    }

    #[test]
    fn batch_transport_failures_name_their_ioctl() {
        let (mut client, dev) = client();
        dev.fail_on("KVM_USPT_BATCH_TRACK_START");
        assert_eq!(
            failed_op(client.batch_tracking_start(TrackMode::Exec, 4, 0, false)),
            "KVM_USPT_BATCH_TRACK_START"
        );

        let (mut client, dev) = self::client();
        client
            .batch_tracking_start(TrackMode::Exec, 4, 0, false)
            .unwrap();
        dev.fail_on("KVM_USPT_BATCH_TRACK_EVENT_COUNT");
        dev.fail_on("KVM_USPT_BATCH_TRACK_STOP");
        assert_eq!(
            failed_op(client.batch_tracking_event_count()),
            "KVM_USPT_BATCH_TRACK_EVENT_COUNT"
        );
        assert_eq!(
            failed_op(client.batch_tracking_stop_and_get(2)),
            "KVM_USPT_BATCH_TRACK_STOP"
        );
    }

    #[test]
    fn reset_returns_to_idle() {
        let (mut client, _dev) = client();
        client
            .batch_tracking_start(TrackMode::Access, 10, 0, false)
            .unwrap();
        client.reset().unwrap();
        assert_eq!(client.batch_state(), BatchState::Idle);
        client.reset().unwrap();
        assert_eq!(client.batch_state(), BatchState::Idle);
    }
}
