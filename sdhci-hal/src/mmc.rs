//! # MMC/SD protocol layer
//!
//! Command words, card status decoding and the card register images (OCR,
//! CID, CSD, EXT_CSD) shared by the bring-up code and the request pipeline.
//!
//! The 136-bit responses (CID, CSD) are handled in the layout the
//! response-fetch path assembles them: the card-side register with the
//! 8-bit CRC prefix the controller strips reading as zero, stored most
//! significant word first. Field extraction uses the card-side bit
//! positions unchanged.

use arbitrary_int::{u3, u6, u17};

/// Sector size used on the bus. Cards with larger native sectors are
/// always accessed in 512-byte mode.
pub const SECTOR_SIZE: u32 = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// CMD8 argument: voltage pattern 2.7-3.6 V plus the 0xAA check pattern.
pub const SD_IF_COND_ARG: u32 = 0x1aa;

/// CMD1 argument: sector-mode request plus the 2.7-3.6 V window.
pub const MMC_OP_COND_ARG: u32 = 0x40ff_8000;

/// Expected response kind of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RspKind {
    /// No response.
    None,
    /// 48-bit response with card status.
    R1,
    /// Like R1, with busy signalling on DAT\[0\].
    R1b,
    /// 136-bit response (CID/CSD).
    R2,
    /// 48-bit response without CRC or opcode (OCR).
    R3,
    /// 48-bit response with the published RCA (SD CMD3).
    R6,
    /// 48-bit response echoing the interface condition (SD CMD8).
    R7,
}

/// One in-memory command word: the command index plus everything the
/// submission path needs to know about it.
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct CmdWord {
    #[bits(0..=5, rw)]
    index: u6,
    /// A response is expected.
    #[bit(8, rw)]
    rsp_present: bool,
    /// The response is 136 bits long.
    #[bit(9, rw)]
    rsp_136: bool,
    /// The response CRC is checked by the controller.
    #[bit(10, rw)]
    rsp_crc: bool,
    /// The card signals busy on DAT\[0\] after the response.
    #[bit(11, rw)]
    rsp_busy: bool,
    /// The response carries the command opcode for the index check.
    #[bit(12, rw)]
    rsp_opcode: bool,
    /// The command has a data phase.
    #[bit(13, rw)]
    data: bool,
    /// The data phase direction is card-to-host.
    #[bit(14, rw)]
    dir_read: bool,
    /// Application command, to be preceded by CMD55.
    #[bit(15, rw)]
    app: bool,
}

const fn cmd(index: u8, rsp: RspKind) -> CmdWord {
    let w = CmdWord::new_with_raw_value(0).with_index(u6::new(index));
    match rsp {
        RspKind::None => w,
        RspKind::R1 | RspKind::R6 | RspKind::R7 => w
            .with_rsp_present(true)
            .with_rsp_crc(true)
            .with_rsp_opcode(true),
        RspKind::R1b => w
            .with_rsp_present(true)
            .with_rsp_crc(true)
            .with_rsp_opcode(true)
            .with_rsp_busy(true),
        RspKind::R2 => w.with_rsp_present(true).with_rsp_136(true).with_rsp_crc(true),
        RspKind::R3 => w.with_rsp_present(true),
    }
}

const fn adtc(index: u8, rsp: RspKind, read: bool) -> CmdWord {
    cmd(index, rsp).with_data(true).with_dir_read(read)
}

pub const CMD0_GO_IDLE_STATE: CmdWord = cmd(0, RspKind::None);
pub const CMD1_SEND_OP_COND: CmdWord = cmd(1, RspKind::R3);
pub const CMD2_ALL_SEND_CID: CmdWord = cmd(2, RspKind::R2);
/// SD: the card publishes an RCA.
pub const CMD3_SEND_RELATIVE_ADDR: CmdWord = cmd(3, RspKind::R6);
/// eMMC: the host assigns the RCA.
pub const CMD3_SET_RELATIVE_ADDR: CmdWord = cmd(3, RspKind::R1);
/// eMMC SWITCH (EXT_CSD byte write).
pub const CMD6_SWITCH: CmdWord = cmd(6, RspKind::R1b);
/// SD SWITCH_FUNC with a 64-byte status read.
pub const CMD6_SWITCH_FUNC: CmdWord = adtc(6, RspKind::R1, true);
/// SD ACMD6 (SET_BUS_WIDTH).
pub const ACMD6_SET_BUS_WIDTH: CmdWord = cmd(6, RspKind::R1).with_app(true);
pub const CMD7_SELECT_CARD: CmdWord = cmd(7, RspKind::R1b);
/// SD interface condition probe.
pub const CMD8_SEND_IF_COND: CmdWord = cmd(8, RspKind::R7);
/// eMMC EXT_CSD read (512-byte data phase).
pub const CMD8_SEND_EXT_CSD: CmdWord = adtc(8, RspKind::R1, true);
pub const CMD9_SEND_CSD: CmdWord = cmd(9, RspKind::R2);
/// Stop after a read: plain R1.
pub const CMD12_STOP_TRANSMISSION_RD: CmdWord = cmd(12, RspKind::R1);
/// Stop after a write: R1 with busy.
pub const CMD12_STOP_TRANSMISSION_WR: CmdWord = cmd(12, RspKind::R1b);
pub const CMD13_SEND_STATUS: CmdWord = cmd(13, RspKind::R1);
pub const CMD17_READ_SINGLE_BLOCK: CmdWord = adtc(17, RspKind::R1, true);
pub const CMD18_READ_MULTIPLE_BLOCK: CmdWord = adtc(18, RspKind::R1, true);
/// SD tuning block (64 bytes). Not a regular data command: the transfer
/// runs without DMA, the controller samples it via buffer-read-ready.
pub const CMD19_SEND_TUNING_BLOCK: CmdWord = cmd(19, RspKind::R1).with_dir_read(true);
/// eMMC tuning block (128 bytes at 8-bit bus width).
pub const CMD21_SEND_TUNING_BLOCK: CmdWord = cmd(21, RspKind::R1).with_dir_read(true);
pub const CMD23_SET_BLOCK_COUNT: CmdWord = cmd(23, RspKind::R1);
pub const CMD24_WRITE_BLOCK: CmdWord = adtc(24, RspKind::R1, false);
pub const CMD25_WRITE_MULTIPLE_BLOCK: CmdWord = adtc(25, RspKind::R1, false);
/// SDIO IO_RW_DIRECT (R5). Only used by the soft reset probe that some
/// boards need before a clean restart.
pub const CMD52_IO_RW_DIRECT: CmdWord = cmd(52, RspKind::R1);
pub const CMD55_APP_CMD: CmdWord = cmd(55, RspKind::R1);
pub const ACMD41_SD_SEND_OP_COND: CmdWord = cmd(41, RspKind::R3).with_app(true);
/// SD configuration register read (8-byte data phase).
pub const ACMD51_SEND_SCR: CmdWord = adtc(51, RspKind::R1, true).with_app(true);

impl CmdWord {
    #[inline]
    pub const fn idx(&self) -> u8 {
        self.index().value()
    }

    /// True for the two stop-transmission flavors; they are submitted as
    /// abort-type commands and may be issued against a busy DAT line.
    pub fn is_stop_transmission(&self) -> bool {
        self.idx() == 12
    }

    pub fn is_tuning(&self) -> bool {
        *self == CMD19_SEND_TUNING_BLOCK || *self == CMD21_SEND_TUNING_BLOCK
    }

    pub fn name(&self) -> &'static str {
        match self.idx() {
            0 => "GO_IDLE_STATE",
            1 => "SEND_OP_COND",
            2 => "ALL_SEND_CID",
            3 => "SET/SEND_RELATIVE_ADDR",
            6 => {
                if self.app() {
                    "SET_BUS_WIDTH"
                } else if self.data() {
                    "SWITCH_FUNC"
                } else {
                    "SWITCH"
                }
            }
            7 => "SELECT/DESELECT_CARD",
            8 => {
                if self.data() {
                    "SEND_EXT_CSD"
                } else {
                    "SEND_IF_COND"
                }
            }
            9 => "SEND_CSD",
            12 => "STOP_TRANSMISSION",
            13 => "SEND_STATUS",
            17 => "READ_SINGLE_BLOCK",
            18 => "READ_MULTIPLE_BLOCK",
            19 => "SEND_TUNING_BLOCK",
            21 => "SEND_TUNING_BLOCK_HS200",
            23 => "SET_BLOCK_COUNT",
            24 => "WRITE_BLOCK",
            25 => "WRITE_MULTIPLE_BLOCK",
            41 => {
                if self.app() {
                    "SD_SEND_OP_COND"
                } else {
                    "CMD_unknown"
                }
            }
            51 => {
                if self.app() {
                    "SEND_SCR"
                } else {
                    "CMD_unknown"
                }
            }
            55 => "APP_CMD",
            _ => "CMD_unknown",
        }
    }
}

/// Card states reported in the R1 status word.
#[bitbybit::bitenum(u4, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum CurrentState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Standby = 3,
    Transfer = 4,
    SendingData = 5,
    ReceiveData = 6,
    Programming = 7,
    Disconnect = 8,
    BusTest = 9,
}

/// R1 card status word.
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    #[bit(31, rw)]
    address_out_of_range: bool,
    #[bit(30, rw)]
    address_misalign: bool,
    #[bit(29, rw)]
    block_len_error: bool,
    #[bit(28, rw)]
    erase_seq_error: bool,
    #[bit(26, rw)]
    write_protect_violation: bool,
    #[bit(24, rw)]
    lock_unlock_failed: bool,
    #[bit(23, rw)]
    com_crc_error: bool,
    #[bit(22, rw)]
    illegal_command: bool,
    #[bit(21, rw)]
    card_ecc_failed: bool,
    #[bit(20, rw)]
    cc_error: bool,
    #[bit(19, rw)]
    generic_error: bool,
    #[bits(9..=12, rw)]
    current_state: Option<CurrentState>,
    #[bit(8, rw)]
    ready_for_data: bool,
    /// SWITCH (CMD6) did not take effect.
    #[bit(7, rw)]
    switch_error: bool,
    #[bit(5, rw)]
    app_cmd: bool,
}

impl DeviceStatus {
    /// The card is in transfer state and accepts data.
    pub fn ready(&self) -> bool {
        self.current_state() == Ok(CurrentState::Transfer) && self.ready_for_data()
    }

    pub fn state_name(&self) -> &'static str {
        match self.current_state() {
            Ok(CurrentState::Idle) => "Idle",
            Ok(CurrentState::Ready) => "Ready",
            Ok(CurrentState::Ident) => "Ident",
            Ok(CurrentState::Standby) => "Standby",
            Ok(CurrentState::Transfer) => "Transfer",
            Ok(CurrentState::SendingData) => "SendingData",
            Ok(CurrentState::ReceiveData) => "ReceiveData",
            Ok(CurrentState::Programming) => "Programming",
            Ok(CurrentState::Disconnect) => "Disconnect",
            Ok(CurrentState::BusTest) => "BusTest",
            Err(_) => "reserved",
        }
    }
}

/// Operating conditions register, as exchanged via ACMD41 (SD) and CMD1
/// (eMMC).
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct Ocr {
    /// Power-up sequence finished (response only).
    #[bit(31, rw)]
    powered_up: bool,
    /// Card capacity status in responses (CCS), sector-mode request in
    /// arguments.
    #[bit(30, rw)]
    sector_mode: bool,
    /// 1.8 V request (SD argument encoding of this driver).
    #[bit(28, rw)]
    v18_request: bool,
    /// Voltage window, one bit per 100 mV step starting at 2.0 V.
    #[bits(8..=23, rw)]
    voltage_window: u16,
}

impl Ocr {
    /// 3.2-3.3 V window bit.
    pub const V32_33: u16 = 1 << 12;
    /// 3.3-3.4 V window bit.
    pub const V33_34: u16 = 1 << 13;

    /// The voltage window advertised by this host (3.2-3.4 V).
    pub const fn host_window() -> u16 {
        Self::V32_33 | Self::V33_34
    }
}

/// Extract card-side bits `[hi:lo]` from an assembled 136-bit response:
/// `resp[0]` holds bits 127:96 down to `resp[3]` holding bits 31:0, with
/// the stripped CRC byte (bits 7:0) reading as zero. `hi`/`lo` use the
/// card-side numbering, `lo` must be at least 8 and `hi - lo` at most 31.
pub fn resp_bits(resp: &[u32; 4], hi: u32, lo: u32) -> u32 {
    debug_assert!(hi >= lo && lo >= 8 && hi < 128 && hi - lo < 32);
    // The word containing `lo` and, if the field straddles, the one above.
    let lo_word = (lo / 32) as usize;
    let mut value = resp[3 - lo_word] as u64;
    if (hi / 32) as usize != lo_word {
        value |= (resp[3 - lo_word - 1] as u64) << 32;
    }
    ((value >> (lo % 32)) & ((1u64 << (hi - lo + 1)) - 1)) as u32
}

/// Card identification register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cid {
    resp: [u32; 4],
}

impl Cid {
    pub const fn new(resp: [u32; 4]) -> Self {
        Self { resp }
    }

    /// Manufacturer ID, CID\[127:120\].
    pub fn manufacturer_id(&self) -> u8 {
        resp_bits(&self.resp, 127, 120) as u8
    }

    /// Product name: CID\[103:64\] for SD (5 characters), CID\[103:56\]
    /// for eMMC (6 characters). The longer variant is returned; SD callers
    /// take the first five bytes.
    pub fn product_name(&self) -> [u8; 6] {
        let mut name = [0u8; 6];
        for (i, c) in name.iter_mut().enumerate() {
            *c = resp_bits(&self.resp, 103 - 8 * i as u32, 96 - 8 * i as u32) as u8;
        }
        name
    }

    /// Product serial number: CID\[55:24\] for SD.
    pub fn serial_sd(&self) -> u32 {
        resp_bits(&self.resp, 55, 24)
    }

    /// Product serial number: CID\[47:16\] for eMMC.
    pub fn serial_mmc(&self) -> u32 {
        resp_bits(&self.resp, 47, 16)
    }
}

/// Card specific data register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Csd {
    resp: [u32; 4],
}

impl Csd {
    pub const fn new(resp: [u32; 4]) -> Self {
        Self { resp }
    }

    /// CSD structure version, CSD\[127:126\]: 0 = v1.0, 1 = v2.0 (SD);
    /// 3 = version in EXT_CSD (eMMC).
    pub fn version(&self) -> u8 {
        resp_bits(&self.resp, 127, 126) as u8
    }

    /// eMMC specification version, CSD\[125:122\].
    pub fn spec_vers(&self) -> u8 {
        resp_bits(&self.resp, 125, 122) as u8
    }

    /// Device capacity in bytes.
    ///
    /// CSD v1: `(c_size + 1) * 2^(c_size_mult + 2) * 2^read_bl_len` with
    /// c_size at \[73:62\], c_size_mult at \[49:47\] and read_bl_len at
    /// \[83:80\]. CSD v2: `(c_size + 1) * 512 KiB` with c_size at
    /// \[69:48\]. For eMMC the EXT_CSD sector count supersedes this value.
    pub fn capacity_bytes(&self) -> u64 {
        if self.version() == 1 {
            // SD CSD v2.
            let c_size = resp_bits(&self.resp, 69, 48) as u64;
            (c_size + 1) << 19
        } else {
            // SD CSD v1 and the classic eMMC layout.
            let c_size = resp_bits(&self.resp, 73, 62) as u64;
            let c_size_mult = resp_bits(&self.resp, 49, 47);
            let read_bl_len = resp_bits(&self.resp, 83, 80);
            (c_size + 1) << (c_size_mult + 2) << read_bl_len
        }
    }
}

/// eMMC bus width encodings of EXT_CSD byte 183.
pub mod bus_width {
    pub const W1: u8 = 0;
    pub const W4: u8 = 1;
    pub const W8: u8 = 2;
    pub const W4_DDR: u8 = 5;
    pub const W8_DDR: u8 = 6;
    /// OR-flag: enhanced strobe.
    pub const ENHANCED_STROBE: u8 = 0x80;
}

/// eMMC HS_TIMING encodings of EXT_CSD byte 185.
pub mod hs_timing {
    pub const COMPATIBLE: u8 = 0;
    pub const HIGH_SPEED: u8 = 1;
    pub const HS200: u8 = 2;
    pub const HS400: u8 = 3;
}

/// eMMC device type bits (EXT_CSD byte 196): the timing modes the card
/// advertises. Doubles as the operator-facing disable mask.
#[bitbybit::bitfield(u8, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceType {
    #[bit(7, rw)]
    hs400_ddr_12: bool,
    #[bit(6, rw)]
    hs400_ddr_18: bool,
    #[bit(5, rw)]
    hs200_sdr_12: bool,
    #[bit(4, rw)]
    hs200_sdr_18: bool,
    #[bit(3, rw)]
    hs52_ddr_12: bool,
    #[bit(2, rw)]
    hs52_ddr_18: bool,
    #[bit(1, rw)]
    hs52: bool,
    #[bit(0, rw)]
    hs26: bool,
}

impl DeviceType {
    pub fn hs400(&self) -> bool {
        self.hs400_ddr_12() || self.hs400_ddr_18()
    }

    pub fn hs200(&self) -> bool {
        self.hs200_sdr_12() || self.hs200_sdr_18()
    }

    pub fn hs52_ddr(&self) -> bool {
        self.hs52_ddr_12() || self.hs52_ddr_18()
    }

    /// Apply the operator disable mask.
    pub fn without(&self, disable: DeviceType) -> DeviceType {
        DeviceType::new_with_raw_value(self.raw_value() & !disable.raw_value())
    }
}

/// Byte indices into the EXT_CSD register image.
pub mod ext_csd {
    pub const RPMB_SIZE_MULT: usize = 168;
    pub const PARTITION_SWITCH_TIME: usize = 199;
    pub const BUS_WIDTH: usize = 183;
    pub const STROBE_SUPPORT: usize = 184;
    pub const HS_TIMING: usize = 185;
    pub const REV: usize = 192;
    pub const DEVICE_TYPE: usize = 196;
    pub const SEC_COUNT: usize = 212;
    pub const BOOT_SIZE_MULT: usize = 226;
}

/// The 512-byte eMMC extended card specific data register, copied out of
/// the DMA buffer after a successful CMD8 read.
#[derive(Clone)]
pub struct ExtCsd {
    data: [u8; 512],
}

impl ExtCsd {
    pub const fn new(data: [u8; 512]) -> Self {
        Self { data }
    }

    #[inline]
    pub fn byte(&self, index: usize) -> u8 {
        self.data[index]
    }

    /// EXT_CSD revision (1.x spec code).
    pub fn rev(&self) -> u8 {
        self.data[ext_csd::REV]
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::new_with_raw_value(self.data[ext_csd::DEVICE_TYPE])
    }

    pub fn hs_timing(&self) -> u8 {
        self.data[ext_csd::HS_TIMING]
    }

    pub fn strobe_support(&self) -> bool {
        self.data[ext_csd::STROBE_SUPPORT] & 1 != 0
    }

    /// User partition size in sectors.
    pub fn sec_count(&self) -> u32 {
        u32::from_le_bytes([
            self.data[ext_csd::SEC_COUNT],
            self.data[ext_csd::SEC_COUNT + 1],
            self.data[ext_csd::SEC_COUNT + 2],
            self.data[ext_csd::SEC_COUNT + 3],
        ])
    }

    /// Size of each boot partition in bytes (128 KiB granularity).
    pub fn boot_partition_size(&self) -> u64 {
        self.data[ext_csd::BOOT_SIZE_MULT] as u64 * 128 * 1024
    }

    /// Size of the RPMB partition in bytes (128 KiB granularity).
    pub fn rpmb_size(&self) -> u64 {
        self.data[ext_csd::RPMB_SIZE_MULT] as u64 * 128 * 1024
    }
}

/// Build the CMD6 (SWITCH) argument for a byte write into the EXT_CSD:
/// access mode 3 (write byte), index and value.
pub const fn mmc_switch_arg(index: u8, value: u8) -> u32 {
    (3 << 24) | ((index as u32) << 16) | ((value as u32) << 8)
}

/// CCCR register index of the I/O abort / reset byte.
pub const SDIO_CCCR_ABORT: u32 = 0x6;

/// CMD52 (IO_RW_DIRECT) argument.
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct ArgIoRwDirect {
    #[bit(31, rw)]
    write: bool,
    #[bits(28..=30, rw)]
    function: u3,
    #[bits(9..=25, rw)]
    address: u17,
    #[bits(0..=7, rw)]
    write_data: u8,
}

/// SD CMD6 function group 1 selections (PLSS table 4-11). OR with
/// [SD_SWITCH_SET] to commit.
pub mod sd_switch {
    pub const SDR12: u32 = 0x00ff_ff00;
    pub const SDR25: u32 = 0x00ff_ff01;
    pub const SDR50: u32 = 0x00ff_1f02;
    pub const SDR104: u32 = 0x00ff_1f03;
    pub const DDR50: u32 = 0x00ff_ff04;
}

/// Set-function bit of the SD CMD6 argument.
pub const SD_SWITCH_SET: u32 = 0x8000_0000;

/// Bus signalling/clocking schemes, shared between SD and eMMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Legacy,
    HighSpeed,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
    MmcDdr52,
    MmcHs200,
    MmcHs400,
}

impl Timing {
    /// Timings that clock data on both edges.
    pub const fn ddr(&self) -> bool {
        matches!(self, Timing::MmcHs400 | Timing::MmcDdr52 | Timing::UhsDdr50)
    }

    /// Timings that require the sampling clock to be tuned.
    pub const fn needs_tuning(&self) -> bool {
        matches!(self, Timing::MmcHs200 | Timing::UhsSdr104)
    }

    /// Timings that require 1.8 V signalling.
    pub const fn needs_1v8(&self) -> bool {
        matches!(
            self,
            Timing::MmcHs200
                | Timing::MmcHs400
                | Timing::UhsSdr12
                | Timing::UhsSdr25
                | Timing::UhsSdr50
                | Timing::UhsSdr104
                | Timing::UhsDdr50
        )
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Timing::Legacy => "legacy",
            Timing::HighSpeed => "high-speed",
            Timing::UhsSdr12 => "SDR12",
            Timing::UhsSdr25 => "SDR25",
            Timing::UhsSdr50 => "SDR50",
            Timing::UhsSdr104 => "SDR104",
            Timing::UhsDdr50 => "DDR50",
            Timing::MmcDdr52 => "DDR52",
            Timing::MmcHs200 => "HS200",
            Timing::MmcHs400 => "HS400",
        }
    }
}

/// Data bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl BusWidth {
    pub const fn bits(&self) -> u32 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

/// Signalling voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voltage {
    V33,
    V18,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_word_encoding() {
        assert_eq!(CMD0_GO_IDLE_STATE.idx(), 0);
        assert!(!CMD0_GO_IDLE_STATE.rsp_present());

        assert_eq!(CMD17_READ_SINGLE_BLOCK.idx(), 17);
        assert!(CMD17_READ_SINGLE_BLOCK.data());
        assert!(CMD17_READ_SINGLE_BLOCK.dir_read());
        assert!(CMD17_READ_SINGLE_BLOCK.rsp_crc());
        assert!(CMD17_READ_SINGLE_BLOCK.rsp_opcode());
        assert!(!CMD17_READ_SINGLE_BLOCK.rsp_busy());

        assert!(CMD25_WRITE_MULTIPLE_BLOCK.data());
        assert!(!CMD25_WRITE_MULTIPLE_BLOCK.dir_read());

        assert!(CMD7_SELECT_CARD.rsp_busy());
        assert!(CMD2_ALL_SEND_CID.rsp_136());
        assert!(!CMD2_ALL_SEND_CID.rsp_opcode());

        // R3 responses carry neither CRC nor opcode.
        assert!(ACMD41_SD_SEND_OP_COND.rsp_present());
        assert!(!ACMD41_SD_SEND_OP_COND.rsp_crc());
        assert!(ACMD41_SD_SEND_OP_COND.app());

        assert!(CMD12_STOP_TRANSMISSION_WR.is_stop_transmission());
        assert!(CMD21_SEND_TUNING_BLOCK.is_tuning());
        assert!(!CMD18_READ_MULTIPLE_BLOCK.is_tuning());
    }

    #[test]
    fn device_status_decode() {
        // Transfer state, ready for data.
        let st = DeviceStatus::new_with_raw_value((4 << 9) | (1 << 8));
        assert_eq!(st.current_state(), Ok(CurrentState::Transfer));
        assert!(st.ready());
        assert!(!st.switch_error());

        let st = DeviceStatus::new_with_raw_value((7 << 9) | (1 << 7));
        assert_eq!(st.current_state(), Ok(CurrentState::Programming));
        assert!(st.switch_error());
        assert!(!st.ready());
    }

    #[test]
    fn ocr_bits() {
        let ocr = Ocr::new_with_raw_value(0x40ff_8080);
        assert!(!ocr.powered_up());
        assert!(ocr.sector_mode());
        let ocr = Ocr::new_with_raw_value(0xc0ff_8080);
        assert!(ocr.powered_up());
        assert_eq!(
            Ocr::new_with_raw_value(0)
                .with_voltage_window(Ocr::host_window())
                .raw_value(),
            (1 << 20) | (1 << 21)
        );
    }

    // A synthetic assembled response with distinctive byte values;
    // resp[0] holds card bits 127:96, the CRC byte reads as zero.
    fn synthetic_resp() -> [u32; 4] {
        [0x0102_0304, 0x0506_0708, 0x090a_0b0c, 0x0d0e_0f00]
    }

    #[test]
    fn resp_bits_extraction() {
        let r = synthetic_resp();
        assert_eq!(resp_bits(&r, 127, 120), 0x01);
        assert_eq!(resp_bits(&r, 123, 116), 0x10);
        assert_eq!(resp_bits(&r, 15, 8), 0x0f);
        assert_eq!(resp_bits(&r, 23, 16), 0x0e);
        assert_eq!(resp_bits(&r, 43, 36), 0xb0);
        // Straddles the resp[2]/resp[3] word boundary.
        assert_eq!(resp_bits(&r, 39, 28), 0xbc0);
    }

    #[test]
    fn csd_v2_capacity() {
        // CSD v2 with c_size = 0x003b37 (an 8 GB class SDHC card):
        // capacity = (c_size + 1) * 512 KiB.
        let mut resp = [0u32; 4];
        // csd_structure = 1 at card bits 127:126.
        resp[0] = 1 << 30;
        // c_size at card bits 69:48: [69:64] in resp[1], [63:48] in resp[2].
        let c_size: u64 = 0x003b37;
        resp[1] |= ((c_size >> 16) & 0x3f) as u32;
        resp[2] = ((c_size & 0xffff) << 16) as u32;
        let csd = Csd::new(resp);
        assert_eq!(csd.version(), 1);
        assert_eq!(csd.capacity_bytes(), (c_size + 1) << 19);
    }

    #[test]
    fn csd_v1_capacity() {
        // CSD v1: read_bl_len = 9, c_size = 2047, c_size_mult = 7
        // -> (2047+1) * 2^9 * 2^9 = 512 MiB.
        let mut resp = [0u32; 4];
        // read_bl_len at card bits 83:80.
        resp[1] |= 9 << 16;
        // c_size at card bits 73:62: [73:64] in resp[1], [63:62] in resp[2].
        let c_size: u32 = 2047;
        resp[1] |= c_size >> 2;
        resp[2] |= (c_size & 0x3) << 30;
        // c_size_mult at card bits 49:47.
        resp[2] |= 7 << 15;
        let csd = Csd::new(resp);
        assert_eq!(csd.version(), 0);
        assert_eq!(csd.capacity_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn ext_csd_fields() {
        let mut data = [0u8; 512];
        data[ext_csd::REV] = 8;
        data[ext_csd::DEVICE_TYPE] = 0x57; // HS400 1.8V, HS200 1.8V, DDR52, HS52, HS26
        data[ext_csd::STROBE_SUPPORT] = 1;
        data[ext_csd::SEC_COUNT..ext_csd::SEC_COUNT + 4]
            .copy_from_slice(&0x0076_0000u32.to_le_bytes());
        data[ext_csd::BOOT_SIZE_MULT] = 32;
        data[ext_csd::RPMB_SIZE_MULT] = 4;
        let ecsd = ExtCsd::new(data);
        assert_eq!(ecsd.rev(), 8);
        let dt = ecsd.device_type();
        assert!(dt.hs400_ddr_18() && dt.hs200_sdr_18() && dt.hs52() && dt.hs26());
        assert!(dt.hs52_ddr_18());
        assert!(!dt.hs400_ddr_12());
        assert!(ecsd.strobe_support());
        assert_eq!(ecsd.sec_count(), 0x0076_0000);
        assert_eq!(ecsd.boot_partition_size(), 4 * 1024 * 1024);
        assert_eq!(ecsd.rpmb_size(), 512 * 1024);

        // Disable mask filtering.
        let disable = DeviceType::new_with_raw_value(0).with_hs400_ddr_18(true);
        let left = dt.without(disable);
        assert!(!left.hs400());
        assert!(left.hs200());
    }

    #[test]
    fn switch_arguments() {
        assert_eq!(mmc_switch_arg(185, 2), 0x03b9_0200);
        assert_eq!(
            SD_SWITCH_SET | sd_switch::SDR104,
            0x80ff_1f03
        );
    }
}
