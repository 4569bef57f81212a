//! Transport to the tracker's ioctl interface.
//!
//! [`TrackerDevice`] is the seam between [`TrackerClient`] and the kernel:
//! one method per command, each a single fixed-size transfer.  The
//! production implementation, [`KvmTrackerDevice`], issues the ioctls on an
//! open `/dev/kvm` descriptor.  Tests substitute an in-memory fake.
//!
//! Methods return raw `io::Error`s; the client attaches the command name.
//!
//! [`TrackerClient`]: crate::client::TrackerClient

use libc::c_void;
use sevstep_protocol::{
    AckEvent, BatchTrackConfig, BatchTrackEventCount, BatchTrackStopAndGet, ReadGuestMemoryParam,
    RetiredInstrPerfConfig, RetiredInstrPerfParam, TrackAllPagesParam, TrackPageParam,
    UserspaceCtx, KVM_READ_GUEST_MEMORY, KVM_TRACK_PAGE, KVM_USPT_ACK_EVENT,
    KVM_USPT_BATCH_TRACK_EVENT_COUNT, KVM_USPT_BATCH_TRACK_START, KVM_USPT_BATCH_TRACK_STOP,
    KVM_USPT_POLL_EVENT, KVM_USPT_READ_RETINSTR_PERF, KVM_USPT_REGISTER_PID, KVM_USPT_RESET,
    KVM_USPT_SETUP_RETINSTR_PERF, KVM_USPT_TRACK_ALL, KVM_USPT_UNTRACK_ALL,
    PAGE_FAULT_RECORD_SIZE,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

// ═══════════════════════════════════════════════════════════════════════
//  Transport trait
// ═══════════════════════════════════════════════════════════════════════

/// One method per tracker command.
pub trait TrackerDevice {
    fn register(&mut self, ctx: &UserspaceCtx) -> io::Result<()>;

    fn reset(&mut self) -> io::Result<()>;

    fn track_page(&mut self, param: &TrackPageParam) -> io::Result<()>;

    fn track_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()>;

    fn untrack_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()>;

    /// Fills `out` with one page-fault record if one is pending.  Returns
    /// the non-negative status the kernel handed back.
    fn poll_event(&mut self, out: &mut [u8; PAGE_FAULT_RECORD_SIZE]) -> io::Result<i32>;

    fn ack_event(&mut self, ack: &AckEvent) -> io::Result<()>;

    /// Copies `out.len()` bytes of guest memory starting at `gpa` into `out`.
    fn read_guest_memory(
        &mut self,
        gpa: u64,
        decrypt_with_host_key: bool,
        wbinvd_cpu: i32,
        out: &mut [u8],
    ) -> io::Result<()>;

    fn setup_retired_instr_perf(&mut self, config: &RetiredInstrPerfConfig) -> io::Result<()>;

    fn read_retired_instr_perf(&mut self, cpu: i32) -> io::Result<u64>;

    fn batch_start(&mut self, config: &BatchTrackConfig) -> io::Result<()>;

    fn batch_event_count(&mut self) -> io::Result<u64>;

    /// Stops batch tracking and copies `out.len() / PAGE_FAULT_RECORD_SIZE`
    /// records into `out`.  Returns the kernel's `error_during_batch` flag.
    fn batch_stop(&mut self, out: &mut [u8]) -> io::Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════
//  /dev/kvm implementation
// ═══════════════════════════════════════════════════════════════════════

/// The tracker reached through ioctls on a KVM device node.
#[derive(Debug)]
pub struct KvmTrackerDevice {
    file: File,
}

impl KvmTrackerDevice {
    /// Open `path` read/write.  The node must already exist.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Wrap an already open descriptor.
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    /// Issue `request` with `arg` and return the ioctl's result.
    ///
    /// # Safety
    ///
    /// `arg` must point to memory valid for the size and direction encoded
    /// in `request`, and any pointers embedded in it must be valid for the
    /// lengths they are paired with.
    unsafe fn ioctl(&self, request: u32, arg: *mut c_void) -> io::Result<i32> {
        let ret = libc::ioctl(self.file.as_raw_fd(), request as libc::Ioctl, arg);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret)
    }

    fn ioctl_with<T>(&self, request: u32, arg: &mut T) -> io::Result<i32> {
        // SAFETY: `arg` is a live `repr(C)` value whose size is what
        // `request` was computed from.
        unsafe { self.ioctl(request, arg as *mut T as *mut c_void) }
    }
}

impl TrackerDevice for KvmTrackerDevice {
    fn register(&mut self, ctx: &UserspaceCtx) -> io::Result<()> {
        let mut ctx = *ctx;
        self.ioctl_with(KVM_USPT_REGISTER_PID, &mut ctx).map(drop)
    }

    fn reset(&mut self) -> io::Result<()> {
        // SAFETY: _IO command, no argument is read.
        unsafe { self.ioctl(KVM_USPT_RESET, std::ptr::null_mut()) }.map(drop)
    }

    fn track_page(&mut self, param: &TrackPageParam) -> io::Result<()> {
        let mut param = *param;
        self.ioctl_with(KVM_TRACK_PAGE, &mut param).map(drop)
    }

    fn track_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()> {
        let mut param = *param;
        self.ioctl_with(KVM_USPT_TRACK_ALL, &mut param).map(drop)
    }

    fn untrack_all(&mut self, param: &TrackAllPagesParam) -> io::Result<()> {
        let mut param = *param;
        self.ioctl_with(KVM_USPT_UNTRACK_ALL, &mut param).map(drop)
    }

    fn poll_event(&mut self, out: &mut [u8; PAGE_FAULT_RECORD_SIZE]) -> io::Result<i32> {
        self.ioctl_with(KVM_USPT_POLL_EVENT, out)
    }

    fn ack_event(&mut self, ack: &AckEvent) -> io::Result<()> {
        let mut ack = *ack;
        self.ioctl_with(KVM_USPT_ACK_EVENT, &mut ack).map(drop)
    }

    fn read_guest_memory(
        &mut self,
        gpa: u64,
        decrypt_with_host_key: bool,
        wbinvd_cpu: i32,
        out: &mut [u8],
    ) -> io::Result<()> {
        let mut param = ReadGuestMemoryParam {
            gpa,
            length: out.len() as u64,
            decrypt_with_host_key: decrypt_with_host_key as u8,
            _reserved: [0; 3],
            wbinvd_cpu,
            output_buffer: out.as_mut_ptr() as *mut c_void,
        };
        self.ioctl_with(KVM_READ_GUEST_MEMORY, &mut param).map(drop)
    }

    fn setup_retired_instr_perf(&mut self, config: &RetiredInstrPerfConfig) -> io::Result<()> {
        let mut config = *config;
        self.ioctl_with(KVM_USPT_SETUP_RETINSTR_PERF, &mut config)
            .map(drop)
    }

    fn read_retired_instr_perf(&mut self, cpu: i32) -> io::Result<u64> {
        let mut param = RetiredInstrPerfParam::new(cpu);
        self.ioctl_with(KVM_USPT_READ_RETINSTR_PERF, &mut param)?;
        Ok(param.retired_instruction_count)
    }

    fn batch_start(&mut self, config: &BatchTrackConfig) -> io::Result<()> {
        let mut config = *config;
        self.ioctl_with(KVM_USPT_BATCH_TRACK_START, &mut config)
            .map(drop)
    }

    fn batch_event_count(&mut self) -> io::Result<u64> {
        let mut count = BatchTrackEventCount::default();
        self.ioctl_with(KVM_USPT_BATCH_TRACK_EVENT_COUNT, &mut count)?;
        Ok(count.event_count)
    }

    fn batch_stop(&mut self, out: &mut [u8]) -> io::Result<bool> {
        let mut param = BatchTrackStopAndGet {
            out_buf: out.as_mut_ptr() as *mut c_void,
            length: (out.len() / PAGE_FAULT_RECORD_SIZE) as u64,
            error_during_batch: 0,
            _reserved: [0; 7],
        };
        self.ioctl_with(KVM_USPT_BATCH_TRACK_STOP, &mut param)?;
        Ok(param.error_during_batch != 0)
    }
}
