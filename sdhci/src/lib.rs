//! # Register definitions for SDHCI-family SD/eMMC host controllers
//!
//! This crate models the register block shared by SD Host Controller
//! Specification v3 implementations and two widespread vendor derivatives:
//! the NXP/Freescale uSDHC (i.MX family) and the Broadcom iProc controller
//! (BCM2711 "emmc2").
//!
//! A handful of offsets carry a different layout depending on the controller
//! variant. Those registers are kept as raw `u32` fields and paired with one
//! bitfield view type per variant (for example [ProtocolControl] for uSDHC
//! and [HostControl] for plain SDHCI at offset 0x28). Registers whose layout
//! is identical across the family are strongly typed directly.
#![no_std]

use arbitrary_int::{u2, u3, u4, u5, u6, u7, u12};

/// Per-descriptor transfer length limit imposed by the 16-bit ADMA2 length
/// field (the zero-length encoding for 65536 is not used by this crate).
pub const ADMA2_MAX_DESC_LEN: u32 = 32768;

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseLength {
    NoResponse = 0b00,
    Length136 = 0b01,
    Length48 = 0b10,
    Length48CheckBusy = 0b11,
}

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum CommandType {
    Normal = 0b00,
    Suspend = 0b01,
    Resume = 0b10,
    Abort = 0b11,
}

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host to card.
    Write = 0,
    /// Card to host.
    Read = 1,
}

/// 0x0C: Transfer mode (low half) and command (high half).
///
/// The bits below bit 8 are only evaluated by plain SDHCI and iProc
/// controllers; the uSDHC moves them into [MixControl] and treats them as
/// reserved here.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct TransferMode {
    /// Command index (CMD0-63).
    #[bits(24..=29, rw)]
    command_index: u6,
    #[bits(22..=23, rw)]
    command_type: CommandType,
    /// Data present select.
    #[bit(21, rw)]
    data_present: bool,
    /// Check the index field of the response against the command index.
    #[bit(20, rw)]
    index_check: bool,
    /// Check the CRC field of the response.
    #[bit(19, rw)]
    crc_check: bool,
    #[bits(16..=17, rw)]
    response_length: ResponseLength,
    /// Multi/single block select.
    #[bit(5, rw)]
    multi_block: bool,
    #[bit(4, rw)]
    direction: TransferDirection,
    /// Auto CMD23 enable.
    #[bit(3, rw)]
    auto_cmd23: bool,
    /// Auto CMD12 enable.
    #[bit(2, rw)]
    auto_cmd12: bool,
    /// Block count register enable.
    #[bit(1, rw)]
    block_count_enable: bool,
    #[bit(0, rw)]
    dma_enable: bool,
}

/// 0x04: Block size and block count.
///
/// The SDMA buffer boundary field is only present on plain SDHCI and iProc
/// controllers.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct BlockAttr {
    /// Number of blocks for the transfer.
    #[bits(16..=31, rw)]
    block_count: u16,
    /// SDMA buffer boundary: interrupt every 4K * 2^n bytes.
    #[bits(12..=14, rw)]
    sdma_boundary: u3,
    /// Transfer block size in bytes.
    #[bits(0..=11, rw)]
    block_size: u12,
}

/// 0x24: Present state (read-only).
#[bitbybit::bitfield(u32, debug)]
pub struct PresentState {
    /// DATA0 line signal level, uSDHC numbering (bit 24). On plain SDHCI
    /// this position is the CMD line level instead.
    #[bit(24, r)]
    data0_level_usdhc: bool,
    /// DAT[0] line signal level, SDHCI/iProc numbering (bit 20).
    #[bit(20, r)]
    data0_level: bool,
    /// Write protect switch pin level.
    #[bit(19, r)]
    write_protect: bool,
    /// Card detect pin level.
    #[bit(18, r)]
    card_detect: bool,
    /// Card inserted.
    #[bit(16, r)]
    card_inserted: bool,
    /// Re-tuning request.
    #[bit(12, r)]
    retuning_request: bool,
    /// Buffer read enable.
    #[bit(11, r)]
    buffer_read_enable: bool,
    /// Buffer write enable.
    #[bit(10, r)]
    buffer_write_enable: bool,
    /// Read transfer active.
    #[bit(9, r)]
    read_active: bool,
    /// Write transfer active.
    #[bit(8, r)]
    write_active: bool,
    /// SD clock gated off internally (uSDHC).
    #[bit(7, r)]
    sd_clock_gated_off: bool,
    /// SD clock stable (uSDHC).
    #[bit(3, r)]
    sd_clock_stable: bool,
    /// DAT line active.
    #[bit(2, r)]
    dat_line_active: bool,
    /// Command inhibit (DAT).
    #[bit(1, r)]
    command_inhibit_dat: bool,
    /// Command inhibit (CMD).
    #[bit(0, r)]
    command_inhibit_cmd: bool,
}

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum DmaMode {
    Sdma = 0b00,
    Adma1 = 0b01,
    Adma2_32bit = 0b10,
    Adma2_64bit = 0b11,
}

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum DataTransferWidth {
    OneBit = 0b00,
    FourBit = 0b01,
    EightBit = 0b10,
    Reserved = 0b11,
}

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum EndianMode {
    Big = 0b00,
    BigHalfWord = 0b01,
    Little = 0b10,
    Reserved = 0b11,
}

/// 0x28 (uSDHC view): Protocol control.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ProtocolControl {
    /// Non-exact block read.
    #[bit(30, rw)]
    non_exact_block_read: bool,
    /// Burst length enable.
    #[bits(27..=29, rw)]
    burst_length_enable: u3,
    /// Interrupt at block gap.
    #[bit(19, rw)]
    interrupt_at_block_gap: bool,
    /// Read wait control.
    #[bit(18, rw)]
    read_wait: bool,
    /// Continue request.
    #[bit(17, rw)]
    continue_request: bool,
    /// Stop at block gap request.
    #[bit(16, rw)]
    stop_at_block_gap: bool,
    #[bits(8..=9, rw)]
    dma_mode: DmaMode,
    /// Card detect signal selection.
    #[bit(7, rw)]
    card_detect_signal: bool,
    /// Card detect test level.
    #[bit(6, rw)]
    card_detect_test: bool,
    #[bits(4..=5, rw)]
    endian_mode: EndianMode,
    /// DATA3 as card detection pin.
    #[bit(3, rw)]
    data3_card_detect: bool,
    #[bits(1..=2, rw)]
    data_width: DataTransferWidth,
    /// LED control.
    #[bit(0, rw)]
    led: bool,
}

/// SD bus voltage select encoding of the SDHCI power control byte.
#[bitbybit::bitenum(u3, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum BusVoltage {
    V18 = 0b101,
    V30 = 0b110,
    V33 = 0b111,
}

/// 0x28 (SDHCI/iProc view): Host control, power control, block gap and
/// wakeup control bytes.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct HostControl {
    #[bits(9..=11, rw)]
    bus_voltage: Option<BusVoltage>,
    /// SD bus power.
    #[bit(8, rw)]
    bus_power: bool,
    /// 8-bit bus select.
    #[bit(5, rw)]
    bus_width_8bit: bool,
    #[bits(3..=4, rw)]
    dma_mode: DmaMode,
    /// High speed enable.
    #[bit(2, rw)]
    high_speed: bool,
    /// 4-bit bus select.
    #[bit(1, rw)]
    bus_width_4bit: bool,
    /// LED control.
    #[bit(0, rw)]
    led: bool,
}

/// 0x2C: System control: clock control, data timeout and software reset.
///
/// The divisor layout differs per variant: the uSDHC uses the
/// `(sdclk_freq_select, divisor)` pair, plain SDHCI v3 and iProc use a
/// 10-bit divider whose upper two bits live in the low half of the
/// `divisor` field position (see [Self::with_divider10]).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct SysControl {
    /// Reset tuning (uSDHC).
    #[bit(28, rw)]
    reset_tuning: bool,
    /// Initialization active (uSDHC).
    #[bit(27, rw)]
    init_active: bool,
    /// Software reset for DAT line.
    #[bit(26, rw)]
    reset_dat: bool,
    /// Software reset for CMD line.
    #[bit(25, rw)]
    reset_cmd: bool,
    /// Software reset for all.
    #[bit(24, rw)]
    reset_all: bool,
    /// Hardware reset (uSDHC `ipp_rst_n`).
    #[bit(23, rw)]
    hw_reset: bool,
    /// Data timeout counter value: timeout is SDCLK * 2^(13 + n).
    #[bits(16..=19, rw)]
    data_timeout: u4,
    /// SDCLK frequency select (uSDHC prescaler, or low 8 divider bits).
    #[bits(8..=15, rw)]
    sdclk_freq_select: u8,
    /// Divisor (uSDHC second-stage divider).
    #[bits(4..=7, rw)]
    divisor: u4,
    /// PLL enable.
    #[bit(3, rw)]
    pll_enable: bool,
    /// SD clock enable.
    #[bit(2, rw)]
    sd_clock_enable: bool,
    /// Internal clock stable.
    #[bit(1, rw)]
    internal_clock_stable: bool,
    /// Internal clock enable.
    #[bit(0, rw)]
    internal_clock_enable: bool,
}

/// Maximum data timeout counter encoding (SDCLK * 2^29).
pub const DATA_TIMEOUT_MAX: u4 = u4::new(15);

impl SysControl {
    /// Program the SDHCI v3 10-bit divider. The upper two bits are folded
    /// into the low positions of the [Self::divisor] field (bits 7:6 of the
    /// register).
    pub const fn with_divider10(self, div: u16) -> Self {
        self.with_sdclk_freq_select((div & 0xff) as u8)
            .with_divisor(u4::new((((div >> 8) & 0b11) as u8) << 2))
    }

    /// The currently programmed 10-bit divider (SDHCI v3 / iProc encoding).
    /// The SD clock is the base clock divided by twice this value (zero
    /// means divide by one).
    pub const fn divider10(&self) -> u32 {
        let hi = (self.divisor().value() >> 2) as u32;
        let div = (hi << 8) | self.sdclk_freq_select() as u32;
        if div == 0 { 1 } else { 2 * div }
    }

    /// Effective uSDHC divider in single data rate mode.
    pub const fn clock_divisor_sdr(&self) -> u32 {
        let pre = self.sdclk_freq_select() as u32;
        (if pre != 0 { pre * 2 } else { 1 }) * (self.divisor().value() as u32 + 1)
    }

    /// Effective uSDHC divider in dual data rate mode.
    pub const fn clock_divisor_ddr(&self) -> u32 {
        let pre = self.sdclk_freq_select() as u32;
        (if pre != 0 { pre * 4 } else { 2 }) * (self.divisor().value() as u32 + 1)
    }
}

/// 0x30: Interrupt status (write 1 to clear).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct InterruptStatus {
    /// DMA error (uSDHC).
    #[bit(28, rw)]
    dma_error: bool,
    /// Tuning error (uSDHC).
    #[bit(26, rw)]
    tuning_error: bool,
    /// Auto CMD12/23 error.
    #[bit(24, rw)]
    auto_cmd_error: bool,
    /// Data end bit error.
    #[bit(22, rw)]
    data_end_bit_error: bool,
    /// Data CRC error.
    #[bit(21, rw)]
    data_crc_error: bool,
    /// Data timeout error.
    #[bit(20, rw)]
    data_timeout_error: bool,
    /// Command index error.
    #[bit(19, rw)]
    command_index_error: bool,
    /// Command end bit error.
    #[bit(18, rw)]
    command_end_bit_error: bool,
    /// Command CRC error.
    #[bit(17, rw)]
    command_crc_error: bool,
    /// Command timeout error.
    #[bit(16, rw)]
    command_timeout_error: bool,
    /// Tuning pass (uSDHC).
    #[bit(13, rw)]
    tuning_pass: bool,
    /// Re-tuning event.
    #[bit(12, rw)]
    retuning_event: bool,
    /// Card interrupt.
    #[bit(8, rw)]
    card_interrupt: bool,
    /// Card removal.
    #[bit(7, rw)]
    card_removal: bool,
    /// Card insertion.
    #[bit(6, rw)]
    card_insertion: bool,
    /// Buffer read ready.
    #[bit(5, rw)]
    buffer_read_ready: bool,
    /// Buffer write ready.
    #[bit(4, rw)]
    buffer_write_ready: bool,
    /// DMA interrupt (SDMA boundary).
    #[bit(3, rw)]
    dma_interrupt: bool,
    /// Block gap event.
    #[bit(2, rw)]
    block_gap_event: bool,
    /// Transfer complete.
    #[bit(1, rw)]
    transfer_complete: bool,
    /// Command complete.
    #[bit(0, rw)]
    command_complete: bool,
}

impl InterruptStatus {
    /// Error during the command phase: index, end bit or CRC error.
    pub const fn cmd_error(&self) -> bool {
        self.command_index_error() || self.command_end_bit_error() || self.command_crc_error()
    }

    /// Error during the data phase: end bit, CRC, timeout or DMA error.
    pub const fn data_error(&self) -> bool {
        self.data_end_bit_error()
            || self.data_crc_error()
            || self.data_timeout_error()
            || self.dma_error()
    }

    /// An acknowledge word clearing exactly the command phase errors of
    /// `other`.
    pub const fn ack_cmd_error(other: &Self) -> Self {
        Self::new_with_raw_value(0)
            .with_command_index_error(other.command_index_error())
            .with_command_end_bit_error(other.command_end_bit_error())
            .with_command_crc_error(other.command_crc_error())
    }

    /// An acknowledge word clearing exactly the data phase errors of
    /// `other`.
    pub const fn ack_data_error(other: &Self) -> Self {
        Self::new_with_raw_value(0)
            .with_data_end_bit_error(other.data_end_bit_error())
            .with_data_crc_error(other.data_crc_error())
            .with_data_timeout_error(other.data_timeout_error())
            .with_dma_error(other.dma_error())
    }
}

/// 0x34 / 0x38: Interrupt status enable and interrupt signal enable share
/// the [InterruptStatus] bit layout.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct InterruptEnable {
    #[bit(28, rw)]
    dma_error: bool,
    #[bit(26, rw)]
    tuning_error: bool,
    #[bit(24, rw)]
    auto_cmd_error: bool,
    #[bit(22, rw)]
    data_end_bit_error: bool,
    #[bit(21, rw)]
    data_crc_error: bool,
    #[bit(20, rw)]
    data_timeout_error: bool,
    #[bit(19, rw)]
    command_index_error: bool,
    #[bit(18, rw)]
    command_end_bit_error: bool,
    #[bit(17, rw)]
    command_crc_error: bool,
    #[bit(16, rw)]
    command_timeout_error: bool,
    #[bit(13, rw)]
    tuning_pass: bool,
    #[bit(12, rw)]
    retuning_event: bool,
    #[bit(8, rw)]
    card_interrupt: bool,
    #[bit(7, rw)]
    card_removal: bool,
    #[bit(6, rw)]
    card_insertion: bool,
    #[bit(5, rw)]
    buffer_read_ready: bool,
    #[bit(4, rw)]
    buffer_write_ready: bool,
    #[bit(3, rw)]
    dma_interrupt: bool,
    #[bit(2, rw)]
    block_gap_event: bool,
    #[bit(1, rw)]
    transfer_complete: bool,
    #[bit(0, rw)]
    command_complete: bool,
}

/// UHS mode select encoding of SDHCI host control 2.
#[bitbybit::bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum UhsMode {
    Sdr12 = 0b000,
    Sdr25 = 0b001,
    Sdr50 = 0b010,
    Sdr104 = 0b011,
    Ddr50 = 0b100,
    Hs400 = 0b101,
    Reserved6 = 0b110,
    Reserved7 = 0b111,
}

/// 0x3C: Auto CMD12/23 error status (low half) and, on SDHCI v3 and iProc,
/// the host control 2 register (high half). The tuning state bits occupy
/// the same positions on the uSDHC.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct AutoCmdErrStatus {
    /// Sample clock select: set by the controller once tuning locked.
    #[bit(23, rw)]
    sample_clock_select: bool,
    /// Execute tuning: armed by the host, cleared by the controller.
    #[bit(22, rw)]
    execute_tuning: bool,
    /// 1.8 V signaling enable (host control 2).
    #[bit(19, rw)]
    v18_signaling: bool,
    #[bits(16..=18, rw)]
    uhs_mode: UhsMode,
    /// Command not issued by auto CMD12 error.
    #[bit(7, rw)]
    not_issued: bool,
    /// Auto CMD12/23 index error.
    #[bit(4, rw)]
    index_error: bool,
    /// Auto CMD12/23 CRC error.
    #[bit(3, rw)]
    crc_error: bool,
    /// Auto CMD12/23 end bit error.
    #[bit(2, rw)]
    end_bit_error: bool,
    /// Auto CMD12/23 timeout error.
    #[bit(1, rw)]
    timeout_error: bool,
    /// Auto CMD12 not executed.
    #[bit(0, rw)]
    not_executed: bool,
}

/// 0x40 (uSDHC view): Host controller capabilities.
#[bitbybit::bitfield(u32, debug)]
pub struct UsdhcCapabilities {
    /// 64-bit system addresses (v3 mode).
    #[bit(28, r)]
    bit64_v3: bool,
    /// 64-bit system addresses (v4 mode).
    #[bit(27, r)]
    bit64_v4: bool,
    /// 1.8 V support.
    #[bit(26, r)]
    vs18: bool,
    /// 3.0 V support.
    #[bit(25, r)]
    vs30: bool,
    /// 3.3 V support.
    #[bit(24, r)]
    vs33: bool,
    /// Suspend/resume support.
    #[bit(23, r)]
    suspend_resume: bool,
    /// DMA support.
    #[bit(22, r)]
    dma: bool,
    /// High speed support.
    #[bit(21, r)]
    high_speed: bool,
    /// ADMA support.
    #[bit(20, r)]
    adma: bool,
    /// Maximum block length: 512 << n.
    #[bits(16..=18, r)]
    max_block_length: u3,
    #[bits(14..=15, r)]
    retuning_mode: u2,
    /// Tuning required for SDR50.
    #[bit(13, r)]
    use_tuning_sdr50: bool,
    #[bits(8..=11, r)]
    retuning_time_count: u4,
    #[bit(2, r)]
    ddr50: bool,
    #[bit(1, r)]
    sdr104: bool,
    #[bit(0, r)]
    sdr50: bool,
}

/// 0x40 (SDHCI view): Capabilities register 1.
#[bitbybit::bitfield(u32, debug)]
pub struct SdhciCapabilities {
    #[bits(30..=31, r)]
    slot_type: u2,
    #[bit(29, r)]
    async_interrupt: bool,
    /// 64-bit system addresses (v3 mode).
    #[bit(28, r)]
    bit64_v3: bool,
    /// 64-bit system addresses (v4 mode).
    #[bit(27, r)]
    bit64_v4: bool,
    /// 1.8 V support.
    #[bit(26, r)]
    vs18: bool,
    /// 3.0 V support.
    #[bit(25, r)]
    vs30: bool,
    /// 3.3 V support.
    #[bit(24, r)]
    vs33: bool,
    /// Suspend/resume support.
    #[bit(23, r)]
    suspend_resume: bool,
    /// SDMA support.
    #[bit(22, r)]
    sdma: bool,
    /// High speed support.
    #[bit(21, r)]
    high_speed: bool,
    /// ADMA2 support.
    #[bit(19, r)]
    adma2: bool,
    /// 8-bit bus support.
    #[bit(18, r)]
    bus_8bit: bool,
    /// Maximum block length: 512 << n.
    #[bits(16..=17, r)]
    max_block_length: u2,
    /// Base clock frequency for the SD clock in MHz. Zero means "get the
    /// frequency from another source".
    #[bits(8..=15, r)]
    base_frequency_mhz: u8,
    #[bit(7, r)]
    timeout_clock_unit_mhz: bool,
    #[bits(0..=5, r)]
    timeout_clock_frequency: u6,
}

/// 0x44 (uSDHC view): Watermark level.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct WatermarkLevel {
    /// Write burst length.
    #[bits(24..=28, rw)]
    write_burst_length: u5,
    /// Write watermark level in words.
    #[bits(16..=23, rw)]
    write_watermark: u8,
    /// Read burst length.
    #[bits(8..=12, rw)]
    read_burst_length: u5,
    /// Read watermark level in words.
    #[bits(0..=7, rw)]
    read_watermark: u8,
}

impl WatermarkLevel {
    /// Watermark level used for DMA transfers.
    pub const WML_DMA: u8 = 64;
    /// Burst length used for DMA transfers.
    pub const BURST_DMA: u5 = u5::new(16);
}

/// 0x44 (SDHCI view): Capabilities register 2.
#[bitbybit::bitfield(u32, debug)]
pub struct SdhciCapabilities2 {
    #[bit(28, r)]
    vdd2_18: bool,
    #[bit(27, r)]
    adma2_mode2: bool,
    #[bits(16..=23, r)]
    clock_multiplier: u8,
    #[bits(14..=15, r)]
    retuning_modes: u2,
    /// Tuning required for SDR50.
    #[bit(13, r)]
    use_tuning_sdr50: bool,
    #[bits(8..=11, r)]
    retuning_timer_count: u4,
    #[bit(6, r)]
    driver_type_d: bool,
    #[bit(5, r)]
    driver_type_c: bool,
    #[bit(4, r)]
    driver_type_a: bool,
    #[bit(3, r)]
    uhs2: bool,
    #[bit(2, r)]
    ddr50: bool,
    #[bit(1, r)]
    sdr104: bool,
    #[bit(0, r)]
    sdr50: bool,
}

/// 0x48: Mixer control (uSDHC only).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct MixControl {
    /// Enhanced HS400 (enhanced strobe) enable.
    #[bit(27, rw)]
    enhanced_hs400: bool,
    /// HS400 mode enable.
    #[bit(26, rw)]
    hs400_mode: bool,
    /// Feedback clock source selection.
    #[bit(25, rw)]
    feedback_clock_select: bool,
    /// Auto tuning enable.
    #[bit(24, rw)]
    auto_tune_enable: bool,
    /// Sample clock select (mirrors [AutoCmdErrStatus::sample_clock_select]).
    #[bit(23, rw)]
    sample_clock_select: bool,
    /// Execute tuning.
    #[bit(22, rw)]
    execute_tuning: bool,
    /// Auto CMD23 enable.
    #[bit(7, rw)]
    auto_cmd23: bool,
    /// Nibble position indicator.
    #[bit(6, rw)]
    nibble_position: bool,
    /// Multi/single block select.
    #[bit(5, rw)]
    multi_block: bool,
    #[bit(4, rw)]
    direction: TransferDirection,
    /// Dual data rate mode select.
    #[bit(3, rw)]
    ddr_enable: bool,
    /// Auto CMD12 enable.
    #[bit(2, rw)]
    auto_cmd12: bool,
    /// Block count register enable.
    #[bit(1, rw)]
    block_count_enable: bool,
    #[bit(0, rw)]
    dma_enable: bool,
}

/// ADMA engine state reported in [AdmaErrorStatus].
#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum AdmaState {
    Stop = 0b00,
    FetchDescriptor = 0b01,
    ChangeAddress = 0b10,
    Transfer = 0b11,
}

/// 0x54: ADMA error status.
#[bitbybit::bitfield(u32, debug)]
pub struct AdmaErrorStatus {
    /// Descriptor error.
    #[bit(3, r)]
    descriptor_error: bool,
    /// Length mismatch error.
    #[bit(2, r)]
    length_mismatch: bool,
    #[bits(0..=1, r)]
    state: AdmaState,
}

/// 0x70: Strobe DLL control (uSDHC, HS400 only).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct StrobeDllControl {
    #[bits(28..=31, rw)]
    ref_update_interval: u4,
    #[bits(20..=27, rw)]
    slave_update_interval: u8,
    #[bits(9..=15, rw)]
    slave_override_value: u7,
    #[bit(8, rw)]
    slave_override: bool,
    #[bit(7, rw)]
    gate_update_1: bool,
    #[bit(6, rw)]
    gate_update_0: bool,
    #[bits(3..=5, rw)]
    slave_delay_target: u3,
    #[bit(2, rw)]
    slave_force_update: bool,
    #[bit(1, rw)]
    reset: bool,
    #[bit(0, rw)]
    enable: bool,
}

/// 0x74: Strobe DLL status (uSDHC).
#[bitbybit::bitfield(u32, debug)]
pub struct StrobeDllStatus {
    #[bits(9..=15, r)]
    ref_select: u7,
    #[bits(2..=8, r)]
    slave_select: u7,
    /// Reference DLL locked.
    #[bit(1, r)]
    ref_lock: bool,
    /// Slave DLL locked.
    #[bit(0, r)]
    slave_lock: bool,
}

/// 0xC0: Vendor specific register (uSDHC).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct VendorSpec {
    /// Byte access mode.
    #[bit(31, rw)]
    cmd_byte_enable: bool,
    /// CRC check disable.
    #[bit(15, rw)]
    crc_check_disable: bool,
    /// Card clock software enable.
    #[bit(14, rw)]
    card_clock_enable: bool,
    /// IPG_PERCLK software enable.
    #[bit(13, rw)]
    per_clock_enable: bool,
    /// HCLK software enable.
    #[bit(12, rw)]
    ahb_clock_enable: bool,
    /// IPG clock software enable.
    #[bit(11, rw)]
    ipg_clock_enable: bool,
    /// Force SD clock on.
    #[bit(8, rw)]
    force_sdclk_on: bool,
    /// Auto CMD12 check-busy enable.
    #[bit(3, rw)]
    ac12_check_busy: bool,
    /// CMD line conflict check enable.
    #[bit(2, rw)]
    conflict_check: bool,
    /// Voltage selection: false = 3.0 V, true = 1.8 V.
    #[bit(1, rw)]
    voltage_18: bool,
    /// External DMA request enable.
    #[bit(0, rw)]
    external_dma: bool,
}

/// 0xC8: Vendor specific register 2 (uSDHC).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct VendorSpec2 {
    #[bits(16..=31, rw)]
    feedback_clock_tap: u16,
    #[bit(15, rw)]
    enable_32k_clock: bool,
    /// Use the DMA system address register as the auto CMD23 argument.
    #[bit(12, rw)]
    acmd23_argu2: bool,
    #[bit(11, rw)]
    hs400_read_clock_stop: bool,
    #[bit(10, rw)]
    hs400_write_clock_stop: bool,
    /// Enable busy interrupt.
    #[bit(8, rw)]
    busy_interrupt: bool,
    #[bit(6, rw)]
    tuning_cmd_enable: bool,
    #[bit(5, rw)]
    tuning_1bit_enable: bool,
    #[bit(4, rw)]
    tuning_8bit_enable: bool,
    #[bit(3, rw)]
    card_interrupt_d3_test: bool,
}

/// 0xCC: Tuning control (uSDHC).
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct TuningControl {
    /// Standard tuning circuit enable.
    #[bit(24, rw)]
    std_tuning_enable: bool,
    #[bits(20..=22, rw)]
    tuning_window: u3,
    #[bits(16..=18, rw)]
    tuning_step: u3,
    #[bits(8..=15, rw)]
    tuning_counter: u8,
    /// Disable CRC checking while a tuning command runs.
    #[bit(7, rw)]
    disable_crc_on_tuning: bool,
    #[bits(0..=6, rw)]
    tuning_start_tap: u7,
}

/// 0xFC: Slot interrupt status (low half) and host controller version
/// (high half).
#[bitbybit::bitfield(u32, debug)]
pub struct HostVersion {
    #[bits(24..=31, r)]
    vendor_version: u8,
    /// Specification version: 0 = 1.00, 1 = 2.00, 2 = 3.00, ...
    #[bits(16..=23, r)]
    spec_version: u8,
}

/// SDHCI-family register block.
///
/// Offsets 0x04, 0x28, 0x40 and 0x44 are raw words; wrap them with the
/// matching view type for the controller variant at hand.
#[derive(derive_mmio::Mmio)]
#[repr(C)]
pub struct Registers {
    /// 0x00: DMA system address. Doubles as the second command argument
    /// when the auto CMD23 argument mode is enabled.
    dma_system_addr: u32,
    /// 0x04: Block attributes ([BlockAttr]).
    block_attr: u32,
    /// 0x08: Command argument.
    cmd_arg: u32,
    /// 0x0C: Transfer mode and command. Writing this register dispatches
    /// the command.
    transfer_mode: TransferMode,
    /// 0x10..0x1C: Command response words.
    #[mmio(PureRead)]
    rsp0: u32,
    #[mmio(PureRead)]
    rsp1: u32,
    #[mmio(PureRead)]
    rsp2: u32,
    #[mmio(PureRead)]
    rsp3: u32,
    /// 0x20: Buffer data port.
    buffer_data_port: u32,
    /// 0x24: Present state. Mostly read-only; the uSDHC allows clearing
    /// a stuck command-inhibit flag by writing it.
    #[mmio(PureRead, Write)]
    present_state: PresentState,
    /// 0x28: Protocol control (uSDHC, [ProtocolControl]) or host control
    /// (SDHCI, [HostControl]).
    host_ctrl: u32,
    /// 0x2C: System control.
    sys_ctrl: SysControl,
    /// 0x30: Interrupt status.
    int_status: InterruptStatus,
    /// 0x34: Interrupt status enable.
    int_status_en: InterruptEnable,
    /// 0x38: Interrupt signal enable.
    int_signal_en: InterruptEnable,
    /// 0x3C: Auto CMD12/23 error status and host control 2.
    auto_cmd_err_status: AutoCmdErrStatus,
    /// 0x40: Capabilities ([UsdhcCapabilities] or [SdhciCapabilities]).
    #[mmio(PureRead)]
    capabilities1: u32,
    /// 0x44: Watermark level (uSDHC, [WatermarkLevel]) or capabilities 2
    /// (SDHCI, [SdhciCapabilities2]).
    watermark_or_cap2: u32,
    /// 0x48: Mixer control (uSDHC).
    mix_ctrl: MixControl,
    _reserved0: u32,
    /// 0x50: Force event.
    force_event: u32,
    /// 0x54: ADMA error status.
    #[mmio(PureRead)]
    adma_err_status: AdmaErrorStatus,
    /// 0x58: ADMA system address, low word.
    adma_sys_addr_lo: u32,
    /// 0x5C: ADMA system address, high word.
    adma_sys_addr_hi: u32,
    /// 0x60: DLL control (uSDHC).
    dll_ctrl: u32,
    /// 0x64: DLL status (uSDHC).
    #[mmio(PureRead)]
    dll_status: u32,
    /// 0x68: Clock tuning control and status (uSDHC).
    clk_tune_ctrl_status: u32,
    _reserved1: u32,
    /// 0x70: Strobe DLL control (uSDHC).
    strobe_dll_ctrl: StrobeDllControl,
    /// 0x74: Strobe DLL status (uSDHC).
    #[mmio(PureRead)]
    strobe_dll_status: StrobeDllStatus,
    _reserved2: [u32; 18],
    /// 0xC0: Vendor specific (uSDHC).
    vendor_spec: VendorSpec,
    /// 0xC4: MMC boot (uSDHC).
    mmc_boot: u32,
    /// 0xC8: Vendor specific 2 (uSDHC).
    vendor_spec2: VendorSpec2,
    /// 0xCC: Tuning control (uSDHC).
    tuning_ctrl: TuningControl,
    _reserved3: [u32; 11],
    /// 0xFC: Host controller version.
    #[mmio(PureRead)]
    host_version: HostVersion,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Registers>(), 0x100);

impl Registers {
    /// Create a register block handle for a controller at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped SDHCI-family register
    /// page and the caller must guarantee exclusive ownership of the
    /// peripheral, or otherwise ensure that concurrent accesses do not
    /// interfere with each other.
    pub const unsafe fn new_mmio_fixed(base: usize) -> MmioRegisters<'static> {
        unsafe { Self::new_mmio_at(base) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_control_divider10() {
        let sc = SysControl::new_with_raw_value(0).with_divider10(0x3ff);
        assert_eq!(sc.sdclk_freq_select(), 0xff);
        assert_eq!(sc.divisor().value(), 0b1100);
        assert_eq!(sc.divider10(), 2 * 0x3ff);
        let sc = SysControl::new_with_raw_value(0).with_divider10(0);
        assert_eq!(sc.divider10(), 1);
    }

    #[test]
    fn sys_control_usdhc_divisors() {
        // Prescaler field 4 (divide by 8) and second stage 2 give an
        // effective divider of 16 in SDR mode, 32 in DDR mode.
        let sc = SysControl::new_with_raw_value(0)
            .with_sdclk_freq_select(4)
            .with_divisor(u4::new(1));
        assert_eq!(sc.clock_divisor_sdr(), 16);
        assert_eq!(sc.clock_divisor_ddr(), 32);
        let sc = SysControl::new_with_raw_value(0);
        assert_eq!(sc.clock_divisor_sdr(), 1);
        assert_eq!(sc.clock_divisor_ddr(), 2);
    }

    #[test]
    fn interrupt_status_aggregates() {
        let is = InterruptStatus::new_with_raw_value(0).with_command_crc_error(true);
        assert!(is.cmd_error());
        assert!(!is.data_error());
        let ack = InterruptStatus::ack_cmd_error(&is);
        assert_eq!(ack.raw_value(), 1 << 17);

        let is = InterruptStatus::new_with_raw_value(0)
            .with_data_timeout_error(true)
            .with_dma_error(true);
        assert!(is.data_error());
        let ack = InterruptStatus::ack_data_error(&is);
        assert_eq!(ack.raw_value(), (1 << 20) | (1 << 28));
    }

    #[test]
    fn transfer_mode_layout() {
        let xt = TransferMode::new_with_raw_value(0)
            .with_command_index(u6::new(18))
            .with_response_length(ResponseLength::Length48)
            .with_data_present(true)
            .with_direction(TransferDirection::Read)
            .with_multi_block(true)
            .with_block_count_enable(true)
            .with_dma_enable(true);
        assert_eq!(xt.raw_value(), (18 << 24) | (2 << 16) | (1 << 21) | (1 << 4) | (1 << 5) | 0b10 | 1);
    }
}
