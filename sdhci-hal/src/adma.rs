//! # ADMA2 descriptor engine and bounce buffer
//!
//! Builds ADMA2 descriptor tables (32- or 64-bit schema) in a
//! DMA-coherent page from the scatter segments of a request. Segments
//! whose bus address is out of reach for a 32-bit table are routed
//! through the bounce buffer; transfers longer than the per-descriptor
//! cap are split.
//!
//! The descriptor page is mapped uncached, so plain volatile stores are
//! sufficient and no cache maintenance is performed here. Bounce buffer
//! contents do require maintenance; the caller provides the flush hook.

use vcell::VolatileCell;

use crate::cmd::Segment;
use crate::{DmaRegion, Error};

pub use sdhci::ADMA2_MAX_DESC_LEN;

/// Address ceiling of 32-bit ADMA2 descriptors and SDMA.
pub const ADDR_CEILING_32: u64 = 1 << 32;

/// True if a DMA region reaches beyond what a 32-bit descriptor can
/// address.
#[inline]
pub const fn region_requires_bounce_buffer(dma_addr: u64, size: u32) -> bool {
    dma_addr + size as u64 > ADDR_CEILING_32
}

/// Descriptor action field.
#[bitbybit::bitenum(u3, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum DescAction {
    Nop = 0b000,
    Transfer = 0b100,
    Link = 0b110,
}

/// First word of an ADMA2 descriptor: attributes and length.
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct DescWord0 {
    /// Transfer length in bytes; 32768 is the largest value used here.
    #[bits(16..=31, rw)]
    length: u16,
    #[bits(3..=5, rw)]
    action: Option<DescAction>,
    /// Raise the DMA interrupt when this descriptor completes.
    #[bit(2, rw)]
    interrupt: bool,
    /// Last descriptor of the table.
    #[bit(1, rw)]
    end: bool,
    #[bit(0, rw)]
    valid: bool,
}

/// 32-bit ADMA2 descriptor: attributes/length plus one address word.
#[repr(C)]
pub struct Adma2Desc32 {
    word0: VolatileCell<u32>,
    addr: VolatileCell<u32>,
}
static_assertions::const_assert_eq!(core::mem::size_of::<Adma2Desc32>(), 8);

/// 64-bit ADMA2 descriptor: attributes/length plus two address words and
/// a reserved word.
#[repr(C)]
pub struct Adma2Desc64 {
    word0: VolatileCell<u32>,
    addr_lo: VolatileCell<u32>,
    addr_hi: VolatileCell<u32>,
    _reserved: VolatileCell<u32>,
}
static_assertions::const_assert_eq!(core::mem::size_of::<Adma2Desc64>(), 16);

/// A decoded descriptor, for diagnostics and verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescEntry {
    pub addr: u64,
    pub length: u32,
    pub valid: bool,
    pub end: bool,
    pub transfer: bool,
}

/// The ADMA2 descriptor table of one controller, living in a dedicated
/// uncached DMA page.
pub struct DescriptorTable {
    region: DmaRegion,
    mode64: bool,
}

impl DescriptorTable {
    pub fn new(region: DmaRegion, mode64: bool) -> Self {
        Self { region, mode64 }
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.region.phys()
    }

    #[inline]
    pub fn mode64(&self) -> bool {
        self.mode64
    }

    fn desc_size(&self) -> usize {
        if self.mode64 {
            core::mem::size_of::<Adma2Desc64>()
        } else {
            core::mem::size_of::<Adma2Desc32>()
        }
    }

    /// Number of descriptor slots in the page.
    pub fn capacity(&self) -> usize {
        self.region.len() / self.desc_size()
    }

    fn write_desc(&mut self, index: usize, word0: DescWord0, addr: u64) {
        debug_assert!(index < self.capacity());
        if self.mode64 {
            // Safety: index is within the region, which the embedder
            // guaranteed to be mapped and exclusively ours.
            let d = unsafe {
                &*(self.region.virt().add(index * core::mem::size_of::<Adma2Desc64>())
                    as *const Adma2Desc64)
            };
            d.addr_lo.set(addr as u32);
            d.addr_hi.set((addr >> 32) as u32);
            d._reserved.set(0);
            d.word0.set(word0.raw_value());
        } else {
            let d = unsafe {
                &*(self.region.virt().add(index * core::mem::size_of::<Adma2Desc32>())
                    as *const Adma2Desc32)
            };
            d.addr.set(addr as u32);
            d.word0.set(word0.raw_value());
        }
    }

    /// Read back one descriptor.
    pub fn entry(&self, index: usize) -> DescEntry {
        debug_assert!(index < self.capacity());
        let (word0, addr) = if self.mode64 {
            let d = unsafe {
                &*(self.region.virt().add(index * core::mem::size_of::<Adma2Desc64>())
                    as *const Adma2Desc64)
            };
            (
                DescWord0::new_with_raw_value(d.word0.get()),
                d.addr_lo.get() as u64 | ((d.addr_hi.get() as u64) << 32),
            )
        } else {
            let d = unsafe {
                &*(self.region.virt().add(index * core::mem::size_of::<Adma2Desc32>())
                    as *const Adma2Desc32)
            };
            (DescWord0::new_with_raw_value(d.word0.get()), d.addr.get() as u64)
        };
        DescEntry {
            addr,
            length: word0.length() as u32,
            valid: word0.valid(),
            end: word0.end(),
            transfer: word0.action() == Ok(DescAction::Transfer),
        }
    }

    /// Emit `transfer` descriptors for one contiguous memory region,
    /// splitting at the per-descriptor length cap. The last descriptor
    /// gets the `end` mark when `terminate` is set. Returns the next
    /// free descriptor index.
    fn set_descs_mem_region(
        &mut self,
        mut index: usize,
        mut phys: u64,
        mut size: u32,
        terminate: bool,
    ) -> Result<usize, Error> {
        while size != 0 {
            if index >= self.capacity() {
                log::warn!("too many ADMA2 descriptors");
                return Err(Error::Invalid);
            }
            if !self.mode64 && phys + size as u64 > ADDR_CEILING_32 {
                log::warn!("DMA address beyond 32-bit ADMA2 reach");
                return Err(Error::Invalid);
            }
            let chunk = size.min(ADMA2_MAX_DESC_LEN);
            let word0 = DescWord0::new_with_raw_value(0)
                .with_valid(true)
                .with_action(DescAction::Transfer)
                .with_length(chunk as u16)
                .with_end(size == chunk && terminate);
            self.write_desc(index, word0, phys);
            phys += chunk as u64;
            size -= chunk;
            index += 1;
        }
        Ok(index)
    }

    /// Build the table for a single memory region (internal commands
    /// such as the EXT_CSD read).
    pub fn build_for_region(&mut self, phys: u64, size: u32) -> Result<(), Error> {
        self.set_descs_mem_region(0, phys, size, true)?;
        Ok(())
    }

    /// Build the table for the scatter segments of a client request.
    ///
    /// Segments out of 32-bit reach are redirected through `bounce`; for
    /// writes the client data is copied in and `flush` is invoked for
    /// the exact byte range. Returns whether the bounce buffer was used
    /// (the caller marks the descriptor for read copy-out).
    pub fn build_for_segments(
        &mut self,
        segments: &[Segment],
        read: bool,
        mut bounce: Option<&mut BounceBuffer>,
        flush: &mut dyn FnMut(*const u8, usize),
    ) -> Result<bool, Error> {
        let mut index = 0;
        let mut bb_offs = 0usize;
        let last = segments.len().saturating_sub(1);
        for (i, seg) in segments.iter().enumerate() {
            let mut addr = seg.dma_addr;
            let size = seg.len();
            if !self.mode64 && region_requires_bounce_buffer(addr, size) {
                let bb = bounce.as_deref_mut().ok_or(Error::Invalid)?;
                if bb_offs + size as usize > bb.len() {
                    log::warn!("bounce buffer too small for request");
                    return Err(Error::Invalid);
                }
                if !read {
                    // Safety: the segment's virtual range is owned by the
                    // client for the duration of the request.
                    unsafe { bb.copy_in(bb_offs, seg.virt_addr, size as usize) };
                    flush(unsafe { bb.virt().add(bb_offs) }, size as usize);
                }
                addr = bb.phys() + bb_offs as u64;
                bb_offs += size as usize;
            }
            index = self.set_descs_mem_region(index, addr, size, i == last)?;
        }
        Ok(bb_offs != 0)
    }

    /// Log the constructed table at trace level.
    pub fn trace_dump(&self) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "ADMA descriptors ({}-bit) at phys {:#010x}",
                if self.mode64 { 64 } else { 32 },
                self.phys()
            );
            for i in 0..self.capacity() {
                let e = self.entry(i);
                log::trace!(
                    " {}: addr={:#010x} size={:#07x} valid={} end={}",
                    i,
                    e.addr,
                    e.length,
                    e.valid as u8,
                    e.end as u8
                );
                if e.end {
                    break;
                }
            }
        }
    }
}

/// The bounce buffer: a contiguous controller-reachable shadow region
/// for client segments that are not.
pub struct BounceBuffer {
    region: DmaRegion,
}

impl BounceBuffer {
    pub fn new(region: DmaRegion) -> Self {
        Self { region }
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.region.phys()
    }

    #[inline]
    pub fn virt(&self) -> *mut u8 {
        self.region.virt()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.len() == 0
    }

    /// Copy client data into the buffer before a write transfer.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes and `offset + len` must not
    /// exceed the buffer (checked by the builder).
    pub unsafe fn copy_in(&mut self, offset: usize, src: *const u8, len: usize) {
        debug_assert!(offset + len <= self.len());
        unsafe { core::ptr::copy_nonoverlapping(src, self.virt().add(offset), len) };
    }

    /// Copy received data back out after a read transfer.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes and `offset + len` must not
    /// exceed the buffer.
    pub unsafe fn copy_out(&self, offset: usize, dst: *mut u8, len: usize) {
        debug_assert!(offset + len <= self.len());
        unsafe { core::ptr::copy_nonoverlapping(self.virt().add(offset), dst, len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn table(buf: &mut Vec<u8>, mode64: bool) -> DescriptorTable {
        let region = unsafe { DmaRegion::new(buf.as_mut_ptr(), 0x8000_0000, buf.len()) };
        DescriptorTable::new(region, mode64)
    }

    fn no_flush() -> impl FnMut(*const u8, usize) {
        |_, _| {}
    }

    fn seg(dma_addr: u64, num_sectors: u32) -> Segment {
        Segment {
            dma_addr,
            virt_addr: core::ptr::null_mut(),
            num_sectors,
        }
    }

    #[test]
    fn single_sector_single_descriptor() {
        let mut buf = vec![0u8; 4096];
        let mut t = table(&mut buf, false);
        let bounced = t
            .build_for_segments(&[seg(0x1000_0000, 1)], true, None, &mut no_flush())
            .unwrap();
        assert!(!bounced);
        let e = t.entry(0);
        assert_eq!(
            e,
            DescEntry {
                addr: 0x1000_0000,
                length: 512,
                valid: true,
                end: true,
                transfer: true
            }
        );
    }

    #[test]
    fn split_at_32k_and_terminate_once() {
        let mut buf = vec![0u8; 4096];
        let mut t = table(&mut buf, false);
        // 80 KiB contiguous region: 32K + 32K + 16K.
        t.build_for_region(0x2000_0000, 80 * 1024).unwrap();
        let entries: Vec<_> = (0..3).map(|i| t.entry(i)).collect();
        assert_eq!(entries[0].length, 32768);
        assert_eq!(entries[1].length, 32768);
        assert_eq!(entries[2].length, 16384);
        assert_eq!(entries[1].addr, 0x2000_8000);
        // Exactly one end marker, on the last descriptor; everything
        // before it is a valid transfer descriptor.
        assert!(entries[2].end);
        assert_eq!(entries.iter().filter(|e| e.end).count(), 1);
        assert!(entries.iter().all(|e| e.valid && e.transfer && e.length > 0));
    }

    #[test]
    fn multi_segment_terminates_on_last() {
        let mut buf = vec![0u8; 4096];
        let mut t = table(&mut buf, false);
        t.build_for_segments(
            &[seg(0x1000_0000, 16), seg(0x3000_0000, 16)],
            true,
            None,
            &mut no_flush(),
        )
        .unwrap();
        assert!(!t.entry(0).end);
        assert!(t.entry(1).end);
        assert_eq!(t.entry(1).addr, 0x3000_0000);
        assert_eq!(t.entry(0).length, 16 * 512);
    }

    #[test]
    fn table_overflow_is_invalid() {
        let mut buf = vec![0u8; 32]; // room for four 32-bit descriptors
        let mut t = table(&mut buf, false);
        assert_eq!(t.capacity(), 4);
        let err = t.build_for_region(0x2000_0000, 5 * 32768).unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn high_address_without_bounce_is_invalid() {
        let mut buf = vec![0u8; 4096];
        let mut t = table(&mut buf, false);
        let err = t
            .build_for_segments(&[seg(0x1_0000_0000, 1)], true, None, &mut no_flush())
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn mode64_takes_high_addresses_directly() {
        let mut buf = vec![0u8; 4096];
        let mut t = table(&mut buf, true);
        t.build_for_segments(&[seg(0x1_2345_6000, 1)], true, None, &mut no_flush())
            .unwrap();
        let e = t.entry(0);
        assert_eq!(e.addr, 0x1_2345_6000);
        assert!(e.end && e.valid);
    }

    #[test]
    fn write_segments_bounce_in_order() {
        let mut buf = vec![0u8; 4096];
        let mut bb_mem = vec![0u8; 8192];
        let bb_phys = 0x0800_0000u64;
        let mut bb = BounceBuffer::new(unsafe {
            DmaRegion::new(bb_mem.as_mut_ptr(), bb_phys, bb_mem.len())
        });

        // Two 16-sector segments, both beyond the 32-bit ceiling.
        let mut src_a = vec![0xa5u8; 16 * 512];
        let mut src_b = vec![0x5au8; 16 * 512];
        let segments = [
            Segment {
                dma_addr: 0x0_8000_0000u64 + 0x1_0000_0000,
                virt_addr: src_a.as_mut_ptr(),
                num_sectors: 16,
            },
            Segment {
                dma_addr: 0x1_0000_0000,
                virt_addr: src_b.as_mut_ptr(),
                num_sectors: 16,
            },
        ];

        let mut flushed = Vec::new();
        let mut t = table(&mut buf, false);
        let bounced = t
            .build_for_segments(&segments, false, Some(&mut bb), &mut |p, l| {
                flushed.push((p as usize, l));
            })
            .unwrap();
        assert!(bounced);

        // Both descriptors point into the bounce region, in order.
        assert_eq!(t.entry(0).addr, bb_phys);
        assert_eq!(t.entry(1).addr, bb_phys + 16 * 512);
        assert!(t.entry(1).end);

        // Fidelity: the bytes the controller will read are the
        // concatenation of the segment sources.
        assert_eq!(&bb_mem[..16 * 512], &src_a[..]);
        assert_eq!(&bb_mem[16 * 512..32 * 512], &src_b[..]);

        // The flush hook saw the exact ranges.
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].1, 16 * 512);
    }

    #[test]
    fn bounce_overflow_is_invalid() {
        let mut buf = vec![0u8; 4096];
        let mut bb_mem = vec![0u8; 1024];
        let mut bb = BounceBuffer::new(unsafe {
            DmaRegion::new(bb_mem.as_mut_ptr(), 0x1000, bb_mem.len())
        });
        let mut t = table(&mut buf, false);
        let err = t
            .build_for_segments(&[seg(0x1_0000_0000, 16)], true, Some(&mut bb), &mut no_flush())
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }
}
