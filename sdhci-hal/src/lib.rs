//! # User-space block device core for SDHCI-family SD/eMMC host controllers
//!
//! This crate drives SD/eMMC host controllers of the SDHCI family (generic
//! SDHCI v3, NXP uSDHC, Broadcom iProc/BCM2711) over memory-mapped I/O with
//! DMA and exposes the attached medium as a block device. It builds on the
//! typed register layer of the [sdhci] peripheral access crate.
//!
//! The crate is a passive library: the embedder owns the event loop, maps
//! the register page and DMA memory, and forwards controller interrupts to
//! [device::BlockDevice::handle_irq]. Everything the core needs from its
//! environment is funnelled through the [Platform] trait.
//!
//! Layering, bottom up:
//!
//! - [mmc]: MMC/SD protocol words (commands, card registers).
//! - [cmd]: command descriptors and the bounded descriptor arena.
//! - [adma]: ADMA2 descriptor tables and the bounce buffer.
//! - [host]: the controller state machine (submission, interrupts, clock,
//!   timing, voltage, tuning).
//! - [card]: card bring-up and mode negotiation.
//! - [device]: the block device request pipeline.
#![no_std]

extern crate alloc;

pub mod adma;
pub mod card;
pub mod cmd;
pub mod device;
pub mod host;
pub mod mmc;
pub mod time;

/// The specific flavor of SDHCI controller that is being driven.
///
/// Quirks are keyed off this value at well-defined decision points: DMA
/// mode, clock divider formula, voltage switch path, tuning register set
/// and the post-write delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// Plain SDHCI v3 (e.g. the QEMU PCI controller).
    Sdhci,
    /// NXP/Freescale uSDHC (i.MX family).
    Usdhc,
    /// Broadcom iProc (BCM2711 "emmc2").
    Iproc,
}

impl ControllerKind {
    /// ADMA2 scatter/gather mode is used on everything but iProc, which
    /// falls back to SDMA in this driver.
    #[inline]
    pub const fn dma_adma2(&self) -> bool {
        !matches!(self, ControllerKind::Iproc)
    }

    /// Auto CMD23 saves the preceding CMD23 of a multi-block transfer and
    /// its interrupt. Only wired up for the uSDHC; it rides on the ADMA2
    /// path and the secondary argument register.
    #[inline]
    pub const fn auto_cmd23(&self) -> bool {
        matches!(self, ControllerKind::Usdhc)
    }

    /// Auto CMD12 is kept off for all variants that shipped so far: the
    /// uSDHC does not reliably issue it (erratum ESDHC111) and the others
    /// have not been qualified. Flipping this for a known-good silicon
    /// step is the supported way to enable it.
    #[inline]
    pub const fn auto_cmd12(&self) -> bool {
        false
    }
}

/// Error kinds of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Programmer or configuration error: bad argument, descriptor table
    /// overflow, unsupported path. Not retried.
    #[error("invalid argument or configuration")]
    Invalid,
    /// Transient capacity error: no free command descriptor. The caller
    /// may retry later.
    #[error("no free command descriptor")]
    Busy,
    /// Hardware timeout or unexpected bus state.
    #[error("hardware timeout or unexpected bus state")]
    Io,
    /// The controller reported a command or data error (CRC, end bit,
    /// index, DMA). Propagated to the client, not retried at this layer.
    #[error("card command or data error")]
    Card,
    /// Bring-up failed to settle on a viable operating point. Fatal for
    /// the device.
    #[error("mode negotiation failed")]
    Negotiation,
}

/// Direction of a data transfer, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// Everything the core requires from its execution environment.
///
/// The delay supertrait covers the millisecond/microsecond sleeps during
/// clock transitions and poll loops. The monotonic clock backs every
/// bounded hardware wait and the iProc post-write delay, so it is
/// mandatory whichever controller variant is selected.
pub trait Platform: embedded_hal::delay::DelayNs {
    /// Block until the controller raises an interrupt or an
    /// implementation-defined timeout elapses. `data_phase` tells the
    /// implementation whether the wait is for a (potentially long) data
    /// transfer rather than a command response.
    fn wait_irq(&mut self, data_phase: bool);

    /// Monotonic microsecond clock.
    fn now_us(&mut self) -> u64;

    /// Write back a CPU-cached range before the controller reads it.
    ///
    /// Only ever called for the bounce buffer; DMA-coherent descriptor
    /// memory is expected to be mapped uncached. The default is a no-op
    /// for platforms whose bounce buffer is uncached as well.
    fn cache_flush(&mut self, _virt: *const u8, _len: usize) {}

    /// Invalidate a CPU-cached range after the controller wrote it.
    fn cache_invalidate(&mut self, _virt: *const u8, _len: usize) {}

    /// Map `len` bytes at `offset` inside the client dataspace `dataspace`
    /// for DMA and return the bus address.
    fn dma_map(
        &mut self,
        dataspace: u64,
        offset: u64,
        len: usize,
        dir: Direction,
    ) -> Result<u64, Error>;

    /// Release a mapping previously established with [Self::dma_map].
    fn dma_unmap(&mut self, phys: u64, len: usize, dir: Direction) -> Result<(), Error>;
}

/// A DMA-capable memory region handed to the core by the embedder: the
/// descriptor page, the bounce buffer and the card register image buffer.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    virt: *mut u8,
    phys: u64,
    len: usize,
}

impl DmaRegion {
    /// Describe a DMA region.
    ///
    /// # Safety
    ///
    /// `virt` must point to `len` bytes of memory that stays mapped and
    /// exclusively owned by the core for the lifetime of the region, and
    /// `phys` must be its bus address. Descriptor memory must be mapped
    /// uncached.
    pub const unsafe fn new(virt: *mut u8, phys: u64, len: usize) -> Self {
        Self { virt, phys, len }
    }

    #[inline]
    pub const fn virt(&self) -> *mut u8 {
        self.virt
    }

    #[inline]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The controller must not be writing to the region concurrently.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt, self.len) }
    }
}

// The embedder guarantees exclusive ownership of the mapped region.
unsafe impl Send for DmaRegion {}
