//! # Command descriptors and the bounded descriptor arena
//!
//! One [Cmd] describes a single in-flight MMC command: its command word,
//! argument, data context and completion state. Descriptors live in a
//! fixed-size arena ([CmdQueue]) with stable indices; at most one
//! descriptor is ever in a `Progress*` state, which is how command
//! serialization towards the controller is enforced.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::mmc::{self, CmdWord, DeviceStatus};
use crate::Error;

/// Number of descriptor slots. One is in progress at any time; the rest
/// absorb submission backlog from the block multiplexer.
pub const QUEUE_SLOTS: usize = 8;

/// Completion callback of a client I/O request: error status and the
/// number of bytes transferred.
pub type IoCallback = Box<dyn FnOnce(Result<(), Error>, u64)>;

/// Lifecycle and error state of one command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// Slot is free.
    Unused,
    /// Slot is allocated but not yet initialized for submission.
    Uninitialized,
    /// Initialized, waiting for the controller to become available.
    ReadyForSubmit,
    /// Command phase in progress.
    ProgressCmd,
    /// Data phase in progress.
    ProgressData,
    /// Tuning command executed, controller still sampling.
    TuningProgress,
    Success,
    /// No response within the command timeout.
    CmdTimeout,
    /// Index/end-bit/CRC error during the command phase.
    CmdError,
    /// End-bit/CRC/timeout/DMA error during the data phase.
    DataError,
    /// Only part of the data was transferred.
    DataPartial,
    /// The controller gave up tuning without a sample clock lock.
    TuningFailed,
    /// General error.
    Error,
}

impl CmdStatus {
    /// Terminal failure states.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CmdStatus::CmdTimeout
                | CmdStatus::CmdError
                | CmdStatus::DataError
                | CmdStatus::DataPartial
                | CmdStatus::TuningFailed
                | CmdStatus::Error
        )
    }

    /// The descriptor owns the controller's CMD/DAT lines.
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            CmdStatus::ProgressCmd | CmdStatus::ProgressData | CmdStatus::TuningProgress
        )
    }

    /// Map a terminal state onto the error taxonomy.
    pub fn completion(&self) -> Result<(), Error> {
        match self {
            CmdStatus::Success => Ok(()),
            CmdStatus::CmdTimeout
            | CmdStatus::CmdError
            | CmdStatus::DataError
            | CmdStatus::DataPartial
            | CmdStatus::TuningFailed => Err(Error::Card),
            _ => Err(Error::Io),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            CmdStatus::Unused => "unused",
            CmdStatus::Uninitialized => "uninitialized",
            CmdStatus::ReadyForSubmit => "ready for submit",
            CmdStatus::ProgressCmd => "command phase",
            CmdStatus::ProgressData => "data phase",
            CmdStatus::TuningProgress => "tuning in progress",
            CmdStatus::Success => "success",
            CmdStatus::CmdTimeout => "command phase timeout",
            CmdStatus::CmdError => "command phase error",
            CmdStatus::DataError => "data transfer error",
            CmdStatus::DataPartial => "data partially transferred",
            CmdStatus::TuningFailed => "tuning failed",
            CmdStatus::Error => "general error",
        }
    }
}

/// Per-descriptor flags.
#[bitbybit::bitfield(u16, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct CmdFlags {
    /// The command has a data phase.
    #[bit(0, rw)]
    has_data: bool,
    /// Client I/O request (read or write through the request pipeline).
    #[bit(1, rw)]
    inout: bool,
    /// Data phase reads from the card.
    #[bit(2, rw)]
    inout_read: bool,
    /// A CMD12 must terminate this multi-block transfer.
    #[bit(3, rw)]
    inout_cmd12: bool,
    /// Auto CMD23 is armed for this command.
    #[bit(4, rw)]
    auto_cmd23: bool,
    /// Application command; CMD55 has been or will be issued.
    #[bit(5, rw)]
    app_cmd: bool,
    /// A failure of this command is a legitimate probe outcome and must
    /// not be reported as an error.
    #[bit(6, rw)]
    expected_error: bool,
    /// Read data must be copied out of the bounce buffer on completion.
    #[bit(7, rw)]
    read_from_bounce_buffer: bool,
    /// `resp[0]` holds a valid R1 status word.
    #[bit(8, rw)]
    has_r1_response: bool,
}

/// One node of a client scatter list, copied out of the externally-owned
/// request when the descriptor is armed.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Bus address of the segment.
    pub dma_addr: u64,
    /// CPU-visible address, needed for bounce buffer copies.
    pub virt_addr: *mut u8,
    /// Segment length in 512-byte sectors.
    pub num_sectors: u32,
}

impl Segment {
    #[inline]
    pub const fn len(&self) -> u32 {
        self.num_sectors << mmc::SECTOR_SHIFT
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.num_sectors == 0
    }
}

/// One in-flight (or queued) MMC command.
pub struct Cmd {
    pub cmd: CmdWord,
    pub arg: u32,
    pub flags: CmdFlags,
    /// DMA base address when no scatter list is attached, and the SDMA
    /// restart address during boundary continuation.
    pub data_phys: u64,
    pub blocksize: u32,
    pub blockcnt: u32,
    /// Sectors covered by the whole client request (all segments).
    pub sectors: u32,
    /// First sector of the client request, kept for the
    /// segment-per-command continuation path.
    pub(crate) start_sector: u64,
    pub resp: [u32; 4],
    pub status: CmdStatus,
    /// Scatter segments of a client request. Capacity is retained across
    /// reuse of the slot, so the steady state does not allocate.
    pub(crate) segments: Vec<Segment>,
    /// Next segment to be issued on the segment-per-command (SDMA) path.
    pub(crate) seg_idx: usize,
    pub(crate) cb_io: Option<IoCallback>,
    /// Submission order, for FIFO servicing of queued descriptors.
    seq: u64,
}

impl Cmd {
    const fn empty() -> Self {
        Self {
            cmd: CmdWord::new_with_raw_value(0),
            arg: 0,
            flags: CmdFlags::new_with_raw_value(0),
            data_phys: 0,
            blocksize: 0,
            blockcnt: 0,
            sectors: 0,
            start_sector: 0,
            resp: [0; 4],
            status: CmdStatus::Unused,
            segments: Vec::new(),
            seg_idx: 0,
            cb_io: None,
            seq: 0,
        }
    }

    /// Initialize the descriptor for a fresh command, keeping its slot
    /// and sequence number.
    pub fn init_arg(&mut self, cmd: CmdWord, arg: u32) {
        self.cmd = cmd;
        self.arg = arg;
        self.flags = CmdFlags::new_with_raw_value(0)
            .with_has_data(cmd.data())
            .with_inout_read(cmd.dir_read())
            .with_app_cmd(cmd.app());
        self.data_phys = 0;
        self.blocksize = 0;
        self.blockcnt = 0;
        self.sectors = 0;
        self.start_sector = 0;
        self.resp = [0; 4];
        self.segments.clear();
        self.seg_idx = 0;
        self.status = CmdStatus::ReadyForSubmit;
    }

    /// Initialize with a single DMA data region (used by bring-up reads
    /// like EXT_CSD and the SD switch status).
    pub fn init_data(&mut self, cmd: CmdWord, arg: u32, data_phys: u64, blocksize: u32) {
        self.init_arg(cmd, arg);
        self.data_phys = data_phys;
        self.blocksize = blocksize;
        self.blockcnt = 1;
    }

    #[inline]
    pub fn error(&self) -> bool {
        self.status.is_error()
    }

    #[inline]
    pub fn cmd_idx(&self) -> u8 {
        self.cmd.idx()
    }

    /// The R1 status word of the response, if one was captured.
    pub fn mmc_status(&self) -> Option<DeviceStatus> {
        self.flags
            .has_r1_response()
            .then(|| DeviceStatus::new_with_raw_value(self.resp[0]))
    }

    /// Map a terminal descriptor state onto the error taxonomy.
    pub fn error_kind(&self) -> Result<(), Error> {
        self.status.completion()
    }
}

/// Fixed-capacity descriptor arena.
pub struct CmdQueue {
    slots: [Cmd; QUEUE_SLOTS],
    next_seq: u64,
}

impl CmdQueue {
    pub fn new() -> Self {
        Self {
            slots: [const { Cmd::empty() }; QUEUE_SLOTS],
            next_seq: 0,
        }
    }

    /// Obtain an unused slot. Fails with [Error::Busy] when none is free.
    pub fn create(&mut self) -> Result<usize, Error> {
        let seq = self.next_seq;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.status == CmdStatus::Unused {
                slot.status = CmdStatus::Uninitialized;
                slot.seq = seq;
                self.next_seq += 1;
                return Ok(idx);
            }
        }
        Err(Error::Busy)
    }

    #[inline]
    pub fn cmd(&self, idx: usize) -> &Cmd {
        &self.slots[idx]
    }

    #[inline]
    pub fn cmd_mut(&mut self, idx: usize) -> &mut Cmd {
        &mut self.slots[idx]
    }

    /// The descriptor owning the controller, if any: a descriptor in a
    /// `Progress*` state, or the oldest one that is ready for submission.
    pub fn working(&self) -> Option<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.status.in_progress() {
                return Some(idx);
            }
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == CmdStatus::ReadyForSubmit)
            .min_by_key(|(_, c)| c.seq)
            .map(|(idx, _)| idx)
    }

    /// True while any descriptor is mid-command or mid-data.
    pub fn any_in_progress(&self) -> bool {
        self.slots.iter().any(|c| c.status.in_progress())
    }

    /// Take the completion callback out of a slot.
    pub(crate) fn take_callback(&mut self, idx: usize) -> Option<IoCallback> {
        self.slots[idx].cb_io.take()
    }

    /// Release a slot. All fields are invalidated; clearing the callback
    /// matters, a stale one must never fire for a later occupant.
    pub fn release(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.status = CmdStatus::Unused;
        slot.cmd = CmdWord::new_with_raw_value(0x3f);
        slot.arg = 0;
        slot.flags = CmdFlags::new_with_raw_value(0);
        slot.segments.clear();
        slot.seg_idx = 0;
        slot.cb_io = None;
    }
}

impl Default for CmdQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_exhaustion() {
        let mut q = CmdQueue::new();
        for _ in 0..QUEUE_SLOTS {
            q.create().unwrap();
        }
        assert_eq!(q.create(), Err(Error::Busy));
        q.release(3);
        assert_eq!(q.create(), Ok(3));
    }

    #[test]
    fn working_prefers_in_progress() {
        let mut q = CmdQueue::new();
        let a = q.create().unwrap();
        let b = q.create().unwrap();
        q.cmd_mut(a).init_arg(mmc::CMD13_SEND_STATUS, 0);
        q.cmd_mut(b).init_arg(mmc::CMD13_SEND_STATUS, 0);
        // FIFO order while both are only queued.
        assert_eq!(q.working(), Some(a));
        q.cmd_mut(b).status = CmdStatus::ProgressData;
        assert_eq!(q.working(), Some(b));
        assert!(q.any_in_progress());
        // At most one descriptor is in progress at any time.
        assert_eq!(
            q.slots.iter().filter(|c| c.status.in_progress()).count(),
            1
        );
    }

    #[test]
    fn fifo_order_across_release() {
        let mut q = CmdQueue::new();
        let a = q.create().unwrap();
        q.release(a);
        let b = q.create().unwrap();
        let c = q.create().unwrap();
        // b reuses slot 0 but keeps its younger sequence number.
        assert_eq!(b, a);
        q.cmd_mut(c).init_arg(mmc::CMD13_SEND_STATUS, 0);
        q.cmd_mut(b).init_arg(mmc::CMD13_SEND_STATUS, 0);
        assert_eq!(q.working(), Some(b));
    }

    #[test]
    fn release_clears_callback() {
        let mut q = CmdQueue::new();
        let idx = q.create().unwrap();
        q.cmd_mut(idx).cb_io = Some(Box::new(|_, _| {}));
        q.release(idx);
        assert!(q.cmd(idx).cb_io.is_none());
        assert_eq!(q.cmd(idx).status, CmdStatus::Unused);
    }

    #[test]
    fn init_arg_derives_flags() {
        let mut q = CmdQueue::new();
        let idx = q.create().unwrap();
        q.cmd_mut(idx).init_arg(mmc::CMD18_READ_MULTIPLE_BLOCK, 0x1000);
        let cmd = q.cmd(idx);
        assert!(cmd.flags.has_data());
        assert!(cmd.flags.inout_read());
        assert!(!cmd.flags.app_cmd());
        assert_eq!(cmd.status, CmdStatus::ReadyForSubmit);
        assert_eq!(cmd.mmc_status(), None);
    }
}
