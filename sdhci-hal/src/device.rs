//! # Block device request pipeline
//!
//! Translates multi-segment read/write requests from block clients into
//! MMC commands, manages the auto/manual CMD23/CMD12 policy, drives the
//! host state machine and delivers completion callbacks with the bytes
//! transferred.
//!
//! The embedder forwards every controller interrupt to
//! [BlockDevice::handle_irq]; requests are accepted whenever a command
//! descriptor is free and are executed strictly in submission order.

use alloc::collections::BTreeMap;

use crate::card::{Bringup, DeviceState};
use crate::cmd::{CmdStatus, IoCallback, Segment};
use crate::host::Host;
use crate::mmc::{self, DeviceType};
use crate::{Direction, DmaRegion, Error, Platform};

/// Upper bound on the bytes of one request. Larger requests must be
/// split by the multiplexer.
pub const MAX_REQUEST_BYTES: usize = 4 << 20;

/// Discard/write-zeroes capabilities. All zero: the medium-side erase
/// paths are not wired up, [BlockDevice::discard] reports `Invalid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardInfo {
    pub max_discard_sectors: u32,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_write_zeroes_seg: u32,
}

struct PhysEntry {
    phys: u64,
    sectors: usize,
    refcnt: u32,
}

/// Coalescing cache for client DMA mappings: identical
/// `(dataspace, offset)` mappings must share one bus address, with
/// reference counting. Mutated only from the single-threaded I/O loop.
#[derive(Default)]
struct DmaMapCache {
    by_region: BTreeMap<(u64, u64), PhysEntry>,
    by_phys: BTreeMap<u64, (u64, u64)>,
}

/// One SD/eMMC medium exposed as a block device.
pub struct BlockDevice<P: Platform> {
    host: Host<P>,
    state: Option<DeviceState>,
    /// DMA-coherent scratch buffer for card register images during
    /// bring-up (EXT_CSD and friends). Mapped uncached.
    io_buf: DmaRegion,
    max_seg: usize,
    disable: DeviceType,
    dma_cache: DmaMapCache,
}

impl<P: Platform> BlockDevice<P> {
    /// Wrap a host controller into a block device.
    ///
    /// `io_buf` must be at least 512 bytes of uncached DMA-coherent
    /// memory. `disable` is the operator's eMMC mode disable mask.
    pub fn new(host: Host<P>, io_buf: DmaRegion, max_seg: usize, disable: DeviceType) -> Self {
        Self {
            host,
            state: None,
            io_buf,
            max_seg,
            disable,
            dma_cache: DmaMapCache::default(),
        }
    }

    /// Initialize the controller and bring the card up. `cb` runs once
    /// the device is usable (or bring-up failed for good). The embedder
    /// may run this on a dedicated thread; afterwards the device state
    /// is immutable configuration.
    pub fn start_device_scan(&mut self, cb: impl FnOnce(Result<(), Error>)) {
        let result = self.scan();
        if let Err(e) = result {
            log::warn!("device bring-up failed: {e}");
        }
        cb(result);
    }

    fn scan(&mut self) -> Result<(), Error> {
        if self.io_buf.len() < mmc::SECTOR_SIZE as usize {
            return Err(Error::Invalid);
        }
        self.host.init()?;
        let state = Bringup::new(&mut self.host, self.io_buf, self.disable).run()?;
        self.state = Some(state);
        Ok(())
    }

    /// The device finished bring-up and accepts requests.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    /// The negotiated device state, once bring-up completed.
    #[inline]
    pub fn device_state(&self) -> Option<&DeviceState> {
        self.state.as_ref()
    }

    pub fn capacity(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.capacity())
    }

    #[inline]
    pub fn sector_size(&self) -> usize {
        mmc::SECTOR_SIZE as usize
    }

    /// Maximum bytes of one request. With a bounce buffer every segment
    /// must fit into its share of the buffer.
    pub fn max_size(&self) -> usize {
        let bb = self.host.bounce_size();
        if bb != 0 {
            (bb / self.max_seg).min(MAX_REQUEST_BYTES)
        } else {
            MAX_REQUEST_BYTES
        }
    }

    #[inline]
    pub fn max_segments(&self) -> usize {
        self.max_seg
    }

    /// Match a client-supplied HID against this device. GUID-partition
    /// matching happens in the multiplexer; the core only knows the
    /// product/serial HID.
    pub fn match_hid(&self, hid: &str) -> bool {
        self.state.as_ref().is_some_and(|s| s.hid == hid)
    }

    pub fn discard_info(&self) -> DiscardInfo {
        DiscardInfo::default()
    }

    /// Map client memory for DMA, coalescing identical mappings.
    pub fn dma_map(
        &mut self,
        dataspace: u64,
        offset: u64,
        num_sectors: usize,
        dir: Direction,
    ) -> Result<u64, Error> {
        let key = (dataspace, offset);
        if let Some(entry) = self.dma_cache.by_region.get_mut(&key) {
            if entry.sectors == num_sectors {
                entry.refcnt += 1;
                return Ok(entry.phys);
            }
            log::warn!("mismatched re-map of dataspace {dataspace:#x} offset {offset:#x}");
            return Err(Error::Invalid);
        }
        let len = num_sectors * mmc::SECTOR_SIZE as usize;
        let phys = self.host_platform().dma_map(dataspace, offset, len, dir)?;
        self.dma_cache.by_region.insert(
            key,
            PhysEntry {
                phys,
                sectors: num_sectors,
                refcnt: 1,
            },
        );
        self.dma_cache.by_phys.insert(phys, key);
        Ok(phys)
    }

    /// Release a DMA mapping obtained through [Self::dma_map].
    pub fn dma_unmap(
        &mut self,
        phys: u64,
        num_sectors: usize,
        dir: Direction,
    ) -> Result<(), Error> {
        let len = num_sectors * mmc::SECTOR_SIZE as usize;
        let Some(&key) = self.dma_cache.by_phys.get(&phys) else {
            // Not coalesced; pass straight through.
            return self.host_platform().dma_unmap(phys, len, dir);
        };
        let entry = self
            .dma_cache
            .by_region
            .get_mut(&key)
            .ok_or(Error::Invalid)?;
        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            self.dma_cache.by_region.remove(&key);
            self.dma_cache.by_phys.remove(&phys);
            return self.host_platform().dma_unmap(phys, len, dir);
        }
        Ok(())
    }

    fn host_platform(&mut self) -> &mut P {
        // Platform services are funnelled through the host so that the
        // write-delay bookkeeping stays in one place.
        self.host.platform()
    }

    /// Queue one read/write request.
    ///
    /// `segments` is the client's scatter list; ownership of the DMA
    /// mappings stays with the caller until the callback has fired.
    /// Fails with [Error::Busy] when no descriptor is free, with
    /// [Error::Invalid] for malformed requests.
    pub fn inout_data(
        &mut self,
        start_sector: u64,
        segments: &[Segment],
        dir: Direction,
        cb: IoCallback,
    ) -> Result<(), Error> {
        let Some(state) = self.state.as_ref() else {
            return Err(Error::Invalid);
        };
        if segments.is_empty() || segments.len() > self.max_seg {
            return Err(Error::Invalid);
        }
        let blockcnt: u32 = segments.iter().map(|s| s.num_sectors).sum();
        let bytes = blockcnt as u64 * mmc::SECTOR_SIZE as u64;
        if blockcnt == 0 || bytes > self.max_size() as u64 {
            return Err(Error::Invalid);
        }
        let multi = blockcnt > 1;
        let has_cmd23 = state.has_cmd23;
        let addr_mult = state.addr_mult;

        let word = match (dir, multi) {
            (Direction::Read, false) => mmc::CMD17_READ_SINGLE_BLOCK,
            (Direction::Read, true) => mmc::CMD18_READ_MULTIPLE_BLOCK,
            (Direction::Write, false) => mmc::CMD24_WRITE_BLOCK,
            (Direction::Write, true) => mmc::CMD25_WRITE_MULTIPLE_BLOCK,
        };

        let auto_cmd23 = multi && has_cmd23 && self.host.auto_cmd23();
        let auto_cmd12 = multi && !auto_cmd23 && self.host.auto_cmd12();
        let manual_cmd23 = multi && has_cmd23 && !auto_cmd23;
        // Without any block-count arrangement a CMD12 terminates the
        // transfer, automatically if the controller arms it.
        let needs_cmd12 = multi && !auto_cmd23 && !manual_cmd23;

        let idx = self.host.queue.create()?;
        let adma2 = self.host.dma_adma2();
        {
            let cmd = self.host.queue.cmd_mut(idx);
            cmd.init_arg(word, (start_sector * addr_mult) as u32);
            cmd.flags = cmd
                .flags
                .with_inout(true)
                .with_auto_cmd23(auto_cmd23)
                .with_inout_cmd12(needs_cmd12 || auto_cmd12);
            cmd.blocksize = mmc::SECTOR_SIZE;
            cmd.sectors = blockcnt;
            cmd.start_sector = start_sector;
            cmd.segments.extend_from_slice(segments);
            cmd.seg_idx = 0;
            // ADMA2 covers the entire scatter list with one command; the
            // SDMA path issues one command per segment.
            cmd.blockcnt = if adma2 {
                blockcnt
            } else {
                segments[0].num_sectors
            };
            cmd.cb_io = Some(cb);
        }

        if manual_cmd23 {
            if let Err(e) = self.exec_set_block_count(blockcnt) {
                self.host.queue.release(idx);
                return Err(e);
            }
        }

        self.kick();
        Ok(())
    }

    fn exec_set_block_count(&mut self, blockcnt: u32) -> Result<(), Error> {
        let idx = self.host.queue.create()?;
        self.host
            .queue
            .cmd_mut(idx)
            .init_arg(mmc::CMD23_SET_BLOCK_COUNT, blockcnt);
        let res = self.host.cmd_exec(idx);
        self.host.queue.release(idx);
        res
    }

    /// Flush is a no-op on this path: eMMC/SD acknowledge write
    /// completion with the transfer-complete interrupt, there is no
    /// volatile write cache to drain. The callback fires immediately.
    pub fn flush(&mut self, cb: IoCallback) -> Result<(), Error> {
        if self.state.is_none() {
            return Err(Error::Invalid);
        }
        cb(Ok(()), 0);
        Ok(())
    }

    /// Discard and write-zeroes are unsupported; the advertised
    /// [DiscardInfo] is all-zero accordingly.
    pub fn discard(
        &mut self,
        _start_sector: u64,
        _num_sectors: u64,
        _write_zeroes: bool,
        cb: IoCallback,
    ) -> Result<(), Error> {
        cb(Err(Error::Invalid), 0);
        Err(Error::Invalid)
    }

    /// Interrupt bottom half: advance the state machine, complete
    /// finished requests, submit the next queued descriptor.
    pub fn handle_irq(&mut self) {
        if let Some(idx) = self.host.handle_irq() {
            let status = self.host.queue.cmd(idx).status;
            if status == CmdStatus::Success || status.is_error() {
                self.finish_cmd(idx);
            }
        }
        self.kick();
    }

    fn kick(&mut self) {
        match self.host.cmd_queue_kick() {
            Ok(_) => {}
            Err(e) => {
                // The descriptor could not be dispatched; fail it like a
                // completed command so the client hears about it.
                if let Some(idx) = self.host.queue.working() {
                    log::warn!("submission failed: {e}");
                    self.host.queue.cmd_mut(idx).status = CmdStatus::Error;
                    self.finish_cmd(idx);
                }
            }
        }
    }

    /// Bottom-half completion of the command in slot `idx`.
    fn finish_cmd(&mut self, idx: usize) {
        let cmd = self.host.queue.cmd(idx);
        if !cmd.flags.inout() {
            // Not a client request (bring-up traffic is executed on the
            // blocking path and never lands here).
            self.host.queue.release(idx);
            return;
        }
        let status = cmd.status;
        let flags = cmd.flags;
        let cmd_idx = cmd.cmd_idx();
        let read = flags.inout_read();
        let total_bytes = cmd.sectors as u64 * mmc::SECTOR_SIZE as u64;
        let done_sectors: u32 = cmd.segments[..cmd.seg_idx]
            .iter()
            .map(|s| s.num_sectors)
            .sum();

        if status == CmdStatus::Success {
            // Segment-per-command continuation on the SDMA path.
            let more = !self.host.dma_adma2() && cmd.seg_idx + 1 < cmd.segments.len();
            if more {
                let addr_mult = self.state.as_ref().map_or(1, |s| s.addr_mult);
                let cmd = self.host.queue.cmd_mut(idx);
                cmd.seg_idx += 1;
                let done: u32 = cmd.segments[..cmd.seg_idx]
                    .iter()
                    .map(|s| s.num_sectors)
                    .sum();
                cmd.blockcnt = cmd.segments[cmd.seg_idx].num_sectors;
                cmd.arg = ((cmd.start_sector + done as u64) * addr_mult) as u32;
                cmd.flags = cmd
                    .flags
                    .with_read_from_bounce_buffer(false)
                    .with_has_r1_response(false);
                cmd.status = CmdStatus::ReadyForSubmit;
                return;
            }

            if flags.inout_cmd12() && !self.host.auto_cmd12() {
                // The controller did not arm CMD12; send it by hand
                // before reporting completion.
                if self.exec_stop_transmission(idx, read).is_err() {
                    self.complete(idx, Err(Error::Card), 0);
                    return;
                }
            }
            self.complete(idx, Ok(()), total_bytes);
            return;
        }

        // Errors. A failure mid-way through a segmented transfer is a
        // partial completion; the byte count stays sector-aligned. The
        // original status decides the reported kind, not the outcome of
        // the stop command sent below.
        log::debug!("CMD{cmd_idx} request failed: {}", status.describe());
        let partial_bytes = done_sectors as u64 * mmc::SECTOR_SIZE as u64;
        if flags.inout_cmd12() && !self.host.auto_cmd12() {
            let _ = self.exec_stop_transmission(idx, read);
        }
        let result = match status.completion() {
            Ok(()) => Err(Error::Io),
            e => e,
        };
        self.complete(idx, result, partial_bytes);
    }

    /// Re-arm the slot as a stop-transmission command and execute it.
    /// The completion callback survives; data fields are gone, which is
    /// fine because the byte count was captured by the caller.
    fn exec_stop_transmission(&mut self, idx: usize, read: bool) -> Result<(), Error> {
        let word = if read {
            mmc::CMD12_STOP_TRANSMISSION_RD
        } else {
            mmc::CMD12_STOP_TRANSMISSION_WR
        };
        self.host.queue.cmd_mut(idx).init_arg(word, 0);
        self.host.cmd_exec(idx)
    }

    fn complete(&mut self, idx: usize, result: Result<(), Error>, bytes: u64) {
        let cb = self.host.queue.take_callback(idx);
        self.host.queue.release(idx);
        if let Some(cb) = cb {
            cb(result, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{DeviceState, MediumType};
    use crate::host::tests::{FakeController, TestPlatform, OFF_INT_STATUS, OFF_XFER};
    use crate::mmc::{BusWidth, Cid, Csd, Timing, Voltage};
    use crate::time::Hertz;
    use crate::ControllerKind;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::vec;
    use core::cell::Cell;
    use sdhci::TransferMode;

    fn test_state(has_cmd23: bool) -> DeviceState {
        DeviceState {
            medium: MediumType::Mmc,
            rca: 1,
            num_sectors: 1 << 20,
            addr_mult: 1,
            cid: Cid::default(),
            csd: Csd::default(),
            has_cmd23,
            timing: Timing::MmcHs200,
            bus_width: BusWidth::Eight,
            frequency: Hertz::from_raw(200_000_000),
            voltage: Voltage::V18,
            mmc: None,
            hid: String::from("PROD01-deadbeef"),
        }
    }

    struct TestDevice {
        fc: FakeController,
        _io_mem: alloc::vec::Vec<u8>,
        dev: BlockDevice<TestPlatform>,
    }

    fn device_impl(kind: ControllerKind, has_cmd23: bool, bounce: bool) -> TestDevice {
        let mut fc = FakeController::new();
        let host = if bounce {
            fc.host(kind)
        } else {
            fc.host_without_bounce(kind)
        };
        let mut io_mem = vec![0u8; 512];
        let io_buf =
            unsafe { DmaRegion::new(io_mem.as_mut_ptr(), 0x0a00_0000, io_mem.len()) };
        let mut dev = BlockDevice::new(host, io_buf, 64, DeviceType::new_with_raw_value(0));
        dev.state = Some(test_state(has_cmd23));
        TestDevice {
            fc,
            _io_mem: io_mem,
            dev,
        }
    }

    fn device(kind: ControllerKind, has_cmd23: bool) -> TestDevice {
        device_impl(kind, has_cmd23, false)
    }

    fn seg(dma_addr: u64, num_sectors: u32) -> Segment {
        Segment {
            dma_addr,
            virt_addr: core::ptr::null_mut(),
            num_sectors,
        }
    }

    fn result_hook() -> (Rc<Cell<Option<(bool, u64)>>>, IoCallback) {
        let slot = Rc::new(Cell::new(None));
        let hook = slot.clone();
        (
            slot,
            Box::new(move |res, bytes| hook.set(Some((res.is_ok(), bytes)))),
        )
    }

    #[test]
    fn rejects_bad_requests() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (_r, cb) = result_hook();
        assert_eq!(
            dev.inout_data(0, &[], Direction::Read, cb),
            Err(Error::Invalid)
        );
        // Too many segments.
        let segs = vec![seg(0x1000_0000, 1); 65];
        let (_r, cb) = result_hook();
        assert_eq!(
            dev.inout_data(0, &segs, Direction::Read, cb),
            Err(Error::Invalid)
        );
        // Larger than the request cap.
        let (_r, cb) = result_hook();
        assert_eq!(
            dev.inout_data(0, &[seg(0x1000_0000, 1 << 16)], Direction::Read, cb),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn no_device_is_invalid() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        dev.state = None;
        let (_r, cb) = result_hook();
        assert_eq!(
            dev.inout_data(0, &[seg(0x1000_0000, 1)], Direction::Read, cb),
            Err(Error::Invalid)
        );
        assert_eq!(dev.capacity(), 0);
        assert!(!dev.match_hid("PROD01-deadbeef"));
    }

    #[test]
    fn single_sector_read_completes_with_512_bytes() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (result, cb) = result_hook();
        dev.inout_data(0x1234, &[seg(0x1000_0000, 1)], Direction::Read, cb)
            .unwrap();

        // CMD17 dispatched with the sector number as argument.
        let xt = TransferMode::new_with_raw_value(td.fc.reg(OFF_XFER));
        assert_eq!(xt.command_index().value(), 17);
        assert_eq!(td.fc.reg(0x08), 0x1234);

        // Command complete, then transfer complete.
        td.fc.set_reg(OFF_INT_STATUS, 1);
        dev.handle_irq();
        assert!(result.get().is_none());
        td.fc.set_reg(OFF_INT_STATUS, 2);
        dev.handle_irq();
        assert_eq!(result.get(), Some((true, 512)));
    }

    #[test]
    fn multi_block_read_uses_cmd18_and_auto_cmd23() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (result, cb) = result_hook();
        dev.inout_data(
            0,
            &[seg(0x1000_0000, 16), seg(0x2000_0000, 16)],
            Direction::Read,
            cb,
        )
        .unwrap();

        let xt = TransferMode::new_with_raw_value(td.fc.reg(OFF_XFER));
        assert_eq!(xt.command_index().value(), 18);
        // Auto CMD23 armed: block count in the secondary argument.
        assert_eq!(td.fc.reg(0x00), 32);

        td.fc.set_reg(OFF_INT_STATUS, 1);
        dev.handle_irq();
        td.fc.set_reg(OFF_INT_STATUS, 2);
        dev.handle_irq();
        assert_eq!(result.get(), Some((true, 32 * 512)));
    }

    #[test]
    fn data_crc_error_reports_card_error_with_zero_bytes() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (result, cb) = result_hook();
        dev.inout_data(0, &[seg(0x1000_0000, 8)], Direction::Read, cb)
            .unwrap();

        td.fc.set_reg(OFF_INT_STATUS, 1);
        dev.handle_irq();
        // Data CRC error on a later block.
        td.fc.set_reg(OFF_INT_STATUS, 1 << 21);
        dev.handle_irq();
        assert_eq!(result.get(), Some((false, 0)));

        // The failed descriptor was released; the next request is
        // accepted and dispatches again.
        let (_r2, cb2) = result_hook();
        dev.inout_data(8, &[seg(0x1000_0000, 1)], Direction::Write, cb2)
            .unwrap();
        let xt = TransferMode::new_with_raw_value(td.fc.reg(OFF_XFER));
        assert_eq!(xt.command_index().value(), 24);
    }

    #[test]
    fn queue_exhaustion_is_busy() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        // First request occupies the controller, the rest the queue.
        for _ in 0..crate::cmd::QUEUE_SLOTS {
            let (_r, cb) = result_hook();
            dev.inout_data(0, &[seg(0x1000_0000, 1)], Direction::Read, cb)
                .unwrap();
        }
        let (_r, cb) = result_hook();
        assert_eq!(
            dev.inout_data(0, &[seg(0x1000_0000, 1)], Direction::Read, cb),
            Err(Error::Busy)
        );
    }

    #[test]
    fn requests_complete_in_submission_order() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (r1, cb1) = result_hook();
        let (r2, cb2) = result_hook();
        dev.inout_data(0, &[seg(0x1000_0000, 1)], Direction::Read, cb1)
            .unwrap();
        dev.inout_data(1, &[seg(0x2000_0000, 1)], Direction::Read, cb2)
            .unwrap();

        // First request completes; second is then dispatched.
        td.fc.set_reg(OFF_INT_STATUS, 1);
        dev.handle_irq();
        td.fc.set_reg(OFF_INT_STATUS, 2);
        dev.handle_irq();
        assert_eq!(r1.get(), Some((true, 512)));
        assert!(r2.get().is_none());
        assert_eq!(td.fc.reg(0x08), 1);

        td.fc.set_reg(OFF_INT_STATUS, 1);
        dev.handle_irq();
        td.fc.set_reg(OFF_INT_STATUS, 2);
        dev.handle_irq();
        assert_eq!(r2.get(), Some((true, 512)));
    }

    #[test]
    fn flush_completes_immediately() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let (result, cb) = result_hook();
        dev.flush(cb).unwrap();
        assert_eq!(result.get(), Some((true, 0)));
    }

    #[test]
    fn discard_is_unsupported() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        assert_eq!(dev.discard_info(), DiscardInfo::default());
        let (result, cb) = result_hook();
        assert_eq!(dev.discard(0, 8, false, cb), Err(Error::Invalid));
        assert_eq!(result.get(), Some((false, 0)));
    }

    #[test]
    fn dma_map_coalesces_with_refcounting() {
        let mut td = device(ControllerKind::Usdhc, true);
        let dev = &mut td.dev;
        let p1 = dev.dma_map(7, 0x1000, 8, Direction::Read).unwrap();
        let p2 = dev.dma_map(7, 0x1000, 8, Direction::Read).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(dev.host.platform().maps.len(), 1);

        // First unmap only drops the refcount.
        dev.dma_unmap(p1, 8, Direction::Read).unwrap();
        assert!(dev.host.platform().unmaps.is_empty());
        dev.dma_unmap(p1, 8, Direction::Read).unwrap();
        assert_eq!(dev.host.platform().unmaps.len(), 1);

        // A distinct offset is a distinct mapping.
        let p3 = dev.dma_map(7, 0x2000, 8, Direction::Write).unwrap();
        assert_ne!(p1, p3);
        assert_eq!(dev.host.platform().maps.len(), 2);
    }

    #[test]
    fn max_size_respects_bounce_share() {
        let td = device_impl(ControllerKind::Usdhc, true, true);
        let dev = &td.dev;
        // 8 KiB bounce buffer split over 64 segments.
        assert_eq!(dev.max_size(), 128);
        assert_eq!(dev.max_segments(), 64);
        assert_eq!(dev.sector_size(), 512);
        assert!(dev.match_hid("PROD01-deadbeef"));
        assert!(!dev.match_hid("OTHER-00000000"));
    }
}
