//! Wire protocol between the host-side client and the sevstep page-fault
//! tracker in the patched KVM module.
//!
//! This crate defines the ioctl request numbers, the fixed-layout command
//! argument structs, and the page-fault record schema exchanged with the
//! kernel.  It is `no_std`-compatible with zero dependencies.
//!
//! # Transport
//!
//! Every command is a single `ioctl(2)` on the KVM device file descriptor:
//!
//! 1. Host fills a command struct (e.g. [`TrackPageParam`])
//! 2. Host issues `ioctl(fd, KVM_*, &mut param)`
//! 3. Kernel reads the request, optionally writes result fields back
//! 4. The return value is `0` on success (or a command-specific status,
//!    see [`POLL_STATUS_GOT_EVENT`]); `-1` + errno on failure
//!
//! Page-fault records travel in the other direction, either one at a time
//! ([`KVM_USPT_POLL_EVENT`]) or as an array filled by
//! [`KVM_USPT_BATCH_TRACK_STOP`].  Records are decoded through the explicit
//! little-endian schema in [`PageFaultRecord`] rather than by casting
//! kernel memory to a Rust struct.

#![cfg_attr(not(test), no_std)]

use core::ffi::c_void;
use core::mem::size_of;

// ═══════════════════════════════════════════════════════════════════════
//  ioctl request encoding
// ═══════════════════════════════════════════════════════════════════════

/// ioctl type byte shared by all KVM commands (`KVMIO`).
pub const KVMIO: u32 = 0xAE;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// `_IOC(dir, type, nr, size)` from `asm-generic/ioctl.h`.
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | (ty << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

/// `_IO(KVMIO, nr)`.
pub const fn io(nr: u32) -> u32 {
    ioc(IOC_NONE, KVMIO, nr, 0)
}

/// `_IOWR(KVMIO, nr, T)` where `size` is `sizeof(T)`.
pub const fn iowr(nr: u32, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, KVMIO, nr, size)
}

// ═══════════════════════════════════════════════════════════════════════
//  Command numbers
// ═══════════════════════════════════════════════════════════════════════

/// Track the next access to one page.  Only triggers once; re-arm after
/// every event.  Back-to-back accesses to the same page cannot be tracked.
pub const KVM_TRACK_PAGE: u32 = iowr(0x20, size_of::<TrackPageParam>());

/// Bind the tracker to the calling process.  Must precede every other command.
pub const KVM_USPT_REGISTER_PID: u32 = iowr(0x21, size_of::<UserspaceCtx>());

/// Non-blocking check for a pending page-fault event.
pub const KVM_USPT_POLL_EVENT: u32 = iowr(0x23, PAGE_FAULT_RECORD_SIZE);

/// Acknowledge an event; the faulting vCPU stays paused until this arrives.
pub const KVM_USPT_ACK_EVENT: u32 = iowr(0x24, size_of::<AckEvent>());

/// Read guest memory, optionally decrypted with the host key.
pub const KVM_READ_GUEST_MEMORY: u32 = iowr(0x25, size_of::<ReadGuestMemoryParam>());

/// Stop all tracking and drop pending events.
pub const KVM_USPT_RESET: u32 = io(0x26);

/// Track the first access to every guest page.
pub const KVM_USPT_TRACK_ALL: u32 = iowr(0x27, size_of::<TrackAllPagesParam>());

/// Give the guest access to all pages again.
pub const KVM_USPT_UNTRACK_ALL: u32 = iowr(0x28, size_of::<TrackAllPagesParam>());

/// Program the "retired instructions in guest" counter on one logical CPU.
pub const KVM_USPT_SETUP_RETINSTR_PERF: u32 = iowr(0x30, size_of::<RetiredInstrPerfConfig>());

/// Sample the retired-instruction counter.
pub const KVM_USPT_READ_RETINSTR_PERF: u32 = iowr(0x31, size_of::<RetiredInstrPerfParam>());

/// Begin buffering events in the kernel without per-event notification.
pub const KVM_USPT_BATCH_TRACK_START: u32 = iowr(0x32, size_of::<BatchTrackConfig>());

/// End batch tracking and copy the buffered records out.
pub const KVM_USPT_BATCH_TRACK_STOP: u32 = iowr(0x33, size_of::<BatchTrackStopAndGet>());

/// Number of events buffered so far in the current batch.
pub const KVM_USPT_BATCH_TRACK_EVENT_COUNT: u32 = iowr(0x34, size_of::<BatchTrackEventCount>());

// ═══════════════════════════════════════════════════════════════════════
//  Status codes
// ═══════════════════════════════════════════════════════════════════════

/// `KVM_USPT_POLL_EVENT` return value: the record was filled.
pub const POLL_STATUS_GOT_EVENT: i32 = 0;

/// `KVM_USPT_POLL_EVENT` return value: nothing pending, poll again.
pub const POLL_STATUS_NO_EVENT: i32 = 1000;

/// `wbinvd_cpu` value meaning "do not flush before reading".
pub const NO_WBINVD_CPU: i32 = -1;

// ═══════════════════════════════════════════════════════════════════════
//  Tracking modes
// ═══════════════════════════════════════════════════════════════════════

/// Which guest accesses raise a tracked fault (`enum kvm_page_track_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TrackMode {
    Write = 0,
    Access = 1,
    ResetAccess = 2,
    Exec = 3,
    ResetExec = 4,
}

impl TrackMode {
    pub const ALL: [TrackMode; 5] = [
        TrackMode::Write,
        TrackMode::Access,
        TrackMode::ResetAccess,
        TrackMode::Exec,
        TrackMode::ResetExec,
    ];

    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(TrackMode::Write),
            1 => Some(TrackMode::Access),
            2 => Some(TrackMode::ResetAccess),
            3 => Some(TrackMode::Exec),
            4 => Some(TrackMode::ResetExec),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TrackMode::Write => "write",
            TrackMode::Access => "access",
            TrackMode::ResetAccess => "reset-access",
            TrackMode::Exec => "exec",
            TrackMode::ResetExec => "reset-exec",
        }
    }

    /// Inverse of [`name`](Self::name); also accepts underscores and the
    /// numeric kernel value (`"1"` is `Access`).
    pub fn from_name(s: &str) -> Option<Self> {
        if let Ok(v) = s.parse::<i32>() {
            return Self::from_i32(v);
        }
        Self::ALL.into_iter().find(|m| {
            let name = m.name();
            name.len() == s.len()
                && name
                    .bytes()
                    .zip(s.bytes())
                    .all(|(a, b)| a == b.to_ascii_lowercase() || (a == b'-' && b == b'_'))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Command argument structs
// ═══════════════════════════════════════════════════════════════════════
//
// Layouts mirror the kernel's c_definitions.h.  Padding is spelled out so
// that every byte handed to the kernel is initialised.  Booleans are a
// single byte (C `bool`), written as 0/1.

/// `userspace_ctx_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserspaceCtx {
    pub pid: i32,
    /// Ask the kernel to resolve the guest RIP for each event.  Only works
    /// for plain VMs or SEV-ES guests with the debug policy bit.
    pub get_rip: u8,
    pub _reserved: [u8; 3],
}

impl UserspaceCtx {
    pub const fn new(pid: i32, get_rip: bool) -> Self {
        Self {
            pid,
            get_rip: get_rip as u8,
            _reserved: [0; 3],
        }
    }
}

/// `ack_event_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AckEvent {
    pub id: u64,
}

/// `track_page_param_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrackPageParam {
    pub gpa: u64,
    pub track_mode: i32,
    pub _reserved: [u8; 4],
}

impl TrackPageParam {
    pub const fn new(gpa: u64, mode: TrackMode) -> Self {
        Self {
            gpa,
            track_mode: mode as i32,
            _reserved: [0; 4],
        }
    }
}

/// `track_all_pages_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrackAllPagesParam {
    pub track_mode: i32,
}

impl TrackAllPagesParam {
    pub const fn new(mode: TrackMode) -> Self {
        Self {
            track_mode: mode as i32,
        }
    }
}

/// `read_guest_memory_t`.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────────────
/// 0x00    8     gpa
/// 0x08    8     length
/// 0x10    1     decrypt_with_host_key
/// 0x11    3     (reserved)
/// 0x14    4     wbinvd_cpu            ← -1 = no flush
/// 0x18    8     output_buffer         ← caller-allocated, `length` bytes
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReadGuestMemoryParam {
    pub gpa: u64,
    pub length: u64,
    /// SEV: decrypt with the hypervisor's key.  Yields guest plaintext only
    /// for shared pages; private pages use the guest's own key.
    pub decrypt_with_host_key: u8,
    pub _reserved: [u8; 3],
    /// Logical CPU on which to run `wbinvd` before the read.  Needed on
    /// SEV-ES, where dirty cache lines are not coherent with the read.
    pub wbinvd_cpu: i32,
    pub output_buffer: *mut c_void,
}

/// `retired_instr_perf_config_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetiredInstrPerfConfig {
    /// The counter is per logical CPU; the vCPU must be pinned to it.
    pub cpu: i32,
}

/// `retired_instr_perf_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetiredInstrPerfParam {
    pub cpu: i32,
    pub _reserved: [u8; 4],
    /// Written by the kernel.
    pub retired_instruction_count: u64,
}

impl RetiredInstrPerfParam {
    pub const fn new(cpu: i32) -> Self {
        Self {
            cpu,
            _reserved: [0; 4],
            retired_instruction_count: 0,
        }
    }
}

/// `batch_track_config_t`.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ───────────────
/// 0x00    4     tracking_type
/// 0x04    4     (reserved)
/// 0x08    8     expected_events
/// 0x10    4     perf_cpu
/// 0x14    1     retrack
/// 0x15    3     (reserved)
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BatchTrackConfig {
    pub tracking_type: i32,
    pub _reserved0: [u8; 4],
    /// Room the kernel allocates for buffered events.
    pub expected_events: u64,
    /// Logical CPU whose retired-instruction counter detects re-fault loops
    /// (no progress since the last fault).
    pub perf_cpu: i32,
    /// Re-apply `tracking_type` to each faulted page.  The initial pages
    /// must still be armed by the caller (e.g. `KVM_USPT_TRACK_ALL`).
    pub retrack: u8,
    pub _reserved1: [u8; 3],
}

impl BatchTrackConfig {
    pub const fn new(mode: TrackMode, expected_events: u64, perf_cpu: i32, retrack: bool) -> Self {
        Self {
            tracking_type: mode as i32,
            _reserved0: [0; 4],
            expected_events,
            perf_cpu,
            retrack: retrack as u8,
            _reserved1: [0; 3],
        }
    }
}

/// `batch_track_event_count_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchTrackEventCount {
    pub event_count: u64,
}

/// `batch_track_stop_and_get_t`.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ──────────────────
/// 0x00    8     out_buf             ← length × PAGE_FAULT_RECORD_SIZE bytes
/// 0x08    8     length
/// 0x10    1     error_during_batch  ← written by kernel
/// 0x11    7     (reserved)
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BatchTrackStopAndGet {
    pub out_buf: *mut c_void,
    pub length: u64,
    pub error_during_batch: u8,
    pub _reserved: [u8; 7],
}

// Compile-time layout checks against the kernel header.
const _: () = assert!(size_of::<UserspaceCtx>() == 8);
const _: () = assert!(size_of::<AckEvent>() == 8);
const _: () = assert!(size_of::<TrackPageParam>() == 16);
const _: () = assert!(size_of::<TrackAllPagesParam>() == 4);
const _: () = assert!(size_of::<RetiredInstrPerfConfig>() == 4);
const _: () = assert!(size_of::<RetiredInstrPerfParam>() == 16);
const _: () = assert!(size_of::<BatchTrackConfig>() == 24);
const _: () = assert!(size_of::<BatchTrackEventCount>() == 8);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<ReadGuestMemoryParam>() == 32);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<BatchTrackStopAndGet>() == 24);

// ═══════════════════════════════════════════════════════════════════════
//  Page-fault record (page_fault_event_t)
// ═══════════════════════════════════════════════════════════════════════

/// Size of one page-fault record on the wire.
pub const PAGE_FAULT_RECORD_SIZE: usize = 56;

/// Field offsets of a page-fault record.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ──────────────────────────
/// 0x00    8     id
/// 0x08    8     faulted_gpa
/// 0x10    4     error_code
/// 0x14    1     have_rip_info
/// 0x15    3     (padding)
/// 0x18    8     rip
/// 0x20    8     ns_timestamp
/// 0x28    1     have_retired_instructions
/// 0x29    7     (padding)
/// 0x30    8     retired_instructions
/// ```
pub mod offsets {
    pub const ID: usize = 0x00;
    pub const FAULTED_GPA: usize = 0x08;
    pub const ERROR_CODE: usize = 0x10;
    pub const HAVE_RIP_INFO: usize = 0x14;
    pub const RIP: usize = 0x18;
    pub const NS_TIMESTAMP: usize = 0x20;
    pub const HAVE_RETIRED_INSTRUCTIONS: usize = 0x28;
    pub const RETIRED_INSTRUCTIONS: usize = 0x30;
}

/// One decoded `page_fault_event_t`.  Numeric fields are little-endian;
/// any nonzero flag byte reads as `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFaultRecord {
    pub id: u64,
    pub faulted_gpa: u64,
    /// `PFERR_*` bits, see `arch/x86/include/asm/kvm_host.h`.
    pub error_code: u32,
    pub have_rip_info: bool,
    pub rip: u64,
    pub ns_timestamp: u64,
    pub have_retired_instructions: bool,
    pub retired_instructions: u64,
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

impl PageFaultRecord {
    /// Decode one record from the front of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than [`PAGE_FAULT_RECORD_SIZE`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: &[u8; PAGE_FAULT_RECORD_SIZE] =
            buf.get(..PAGE_FAULT_RECORD_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    /// Decode an exactly sized record.
    pub fn from_bytes(buf: &[u8; PAGE_FAULT_RECORD_SIZE]) -> Self {
        Self {
            id: read_u64(buf, offsets::ID),
            faulted_gpa: read_u64(buf, offsets::FAULTED_GPA),
            error_code: read_u32(buf, offsets::ERROR_CODE),
            have_rip_info: buf[offsets::HAVE_RIP_INFO] != 0,
            rip: read_u64(buf, offsets::RIP),
            ns_timestamp: read_u64(buf, offsets::NS_TIMESTAMP),
            have_retired_instructions: buf[offsets::HAVE_RETIRED_INSTRUCTIONS] != 0,
            retired_instructions: read_u64(buf, offsets::RETIRED_INSTRUCTIONS),
        }
    }

    /// Encode into the front of `buf`, zeroing the padding bytes.
    ///
    /// Returns `None` if `buf` is too small.  The kernel is the only real
    /// producer of records; this exists for fake devices and fixtures.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < PAGE_FAULT_RECORD_SIZE {
            return None;
        }
        let out = &mut buf[..PAGE_FAULT_RECORD_SIZE];
        out.fill(0);
        out[offsets::ID..offsets::ID + 8].copy_from_slice(&self.id.to_le_bytes());
        out[offsets::FAULTED_GPA..offsets::FAULTED_GPA + 8]
            .copy_from_slice(&self.faulted_gpa.to_le_bytes());
        out[offsets::ERROR_CODE..offsets::ERROR_CODE + 4]
            .copy_from_slice(&self.error_code.to_le_bytes());
        out[offsets::HAVE_RIP_INFO] = self.have_rip_info as u8;
        out[offsets::RIP..offsets::RIP + 8].copy_from_slice(&self.rip.to_le_bytes());
        out[offsets::NS_TIMESTAMP..offsets::NS_TIMESTAMP + 8]
            .copy_from_slice(&self.ns_timestamp.to_le_bytes());
        out[offsets::HAVE_RETIRED_INSTRUCTIONS] = self.have_retired_instructions as u8;
        out[offsets::RETIRED_INSTRUCTIONS..offsets::RETIRED_INSTRUCTIONS + 8]
            .copy_from_slice(&self.retired_instructions.to_le_bytes());
        Some(PAGE_FAULT_RECORD_SIZE)
    }
}
