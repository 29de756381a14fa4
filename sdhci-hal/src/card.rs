//! # Card bring-up and mode negotiation
//!
//! Brings an attached SD or eMMC card from power-on to the best operating
//! point the card, the controller and the operator's disable mask allow:
//! voltage negotiation, CID/RCA assignment, CSD/EXT_CSD reading, then a
//! progressive upgrade of timing, bus width and frequency with
//! verification after every step.
//!
//! All commands here run on the blocking execution path of [Host]; the
//! interrupt-driven pipeline only takes over once bring-up has finished.

use alloc::string::String;
use core::fmt::Write as _;

use arbitrary_int::u17;

use crate::cmd::CmdStatus;
use crate::host::Host;
use crate::mmc::{
    self, bus_width, hs_timing, sd_switch, ArgIoRwDirect, BusWidth, Cid, CmdWord, Csd,
    DeviceStatus, DeviceType, ExtCsd, Ocr, Timing, Voltage,
};
use crate::time::Hertz;
use crate::{ControllerKind, DmaRegion, Error, Platform};

/// Budget for the ACMD41/CMD1 ready loop.
const POWER_UP_MS: u32 = 1000;
/// Delay between power-up polls.
const POWER_UP_STEP_MS: u32 = 10;
/// Settle time after a signalling voltage change.
const VOLTAGE_DELAY_MS: u32 = 10;
/// Budget for the CMD13 ready poll after a SWITCH.
const READY_POLL_MS: u32 = 500;
/// Upper bound on tuning command iterations.
const TUNING_LOOPS: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumType {
    Unknown,
    Sd,
    Mmc,
}

/// eMMC-only negotiation results.
#[derive(Clone)]
pub struct MmcState {
    /// Modes the card advertises (EXT_CSD device type).
    pub device_type_supported: DeviceType,
    /// The mode that was settled on.
    pub device_type_selected: DeviceType,
    /// Enhanced strobe active.
    pub enh_strobe: bool,
    /// EXT_CSD revision.
    pub rev: u8,
    /// Partition sizes in bytes.
    pub size_user: u64,
    pub size_boot: u64,
    pub size_rpmb: u64,
}

/// The negotiated, card-acknowledged operating point plus the card
/// identity. Immutable once bring-up hands it over to the I/O path.
#[derive(Clone)]
pub struct DeviceState {
    pub medium: MediumType,
    pub rca: u16,
    pub num_sectors: u64,
    /// Command argument multiplier: 1 for sector-addressed cards,
    /// the sector size for byte-addressed ones.
    pub addr_mult: u64,
    pub cid: Cid,
    pub csd: Csd,
    pub has_cmd23: bool,
    pub timing: Timing,
    pub bus_width: BusWidth,
    pub frequency: Hertz,
    pub voltage: Voltage,
    pub mmc: Option<MmcState>,
    /// Device HID: product name and serial, for client matching.
    pub hid: String,
}

impl DeviceState {
    pub fn capacity(&self) -> u64 {
        self.num_sectors * mmc::SECTOR_SIZE as u64
    }
}

/// eMMC mode preference, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MmcMode {
    Hs400Es,
    Hs400,
    Hs200,
    Ddr52,
    Hs52,
    Hs26,
}

impl MmcMode {
    const ALL: [MmcMode; 6] = [
        MmcMode::Hs400Es,
        MmcMode::Hs400,
        MmcMode::Hs200,
        MmcMode::Ddr52,
        MmcMode::Hs52,
        MmcMode::Hs26,
    ];

    fn timing(&self) -> Timing {
        match self {
            MmcMode::Hs400Es | MmcMode::Hs400 => Timing::MmcHs400,
            MmcMode::Hs200 => Timing::MmcHs200,
            MmcMode::Ddr52 => Timing::MmcDdr52,
            MmcMode::Hs52 => Timing::HighSpeed,
            MmcMode::Hs26 => Timing::Legacy,
        }
    }

    fn frequency(&self) -> Hertz {
        match self {
            MmcMode::Hs400Es | MmcMode::Hs400 | MmcMode::Hs200 => Hertz::from_raw(200_000_000),
            MmcMode::Ddr52 | MmcMode::Hs52 => Hertz::from_raw(52_000_000),
            MmcMode::Hs26 => Hertz::from_raw(26_000_000),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MmcMode::Hs400Es => "HS400 enhanced strobe",
            MmcMode::Hs400 => "HS400",
            MmcMode::Hs200 => "HS200",
            MmcMode::Ddr52 => "DDR52",
            MmcMode::Hs52 => "HS52",
            MmcMode::Hs26 => "HS26",
        }
    }

    /// The device-type bits this mode would occupy, for reporting.
    fn selected_bits(&self) -> DeviceType {
        let dt = DeviceType::new_with_raw_value(0);
        match self {
            MmcMode::Hs400Es | MmcMode::Hs400 => dt.with_hs400_ddr_18(true),
            MmcMode::Hs200 => dt.with_hs200_sdr_18(true),
            MmcMode::Ddr52 => dt.with_hs52_ddr_18(true),
            MmcMode::Hs52 => dt.with_hs52(true),
            MmcMode::Hs26 => dt.with_hs26(true),
        }
    }
}

/// One-shot bring-up context. Owns nothing; borrows the host and the
/// DMA-coherent scratch buffer used for register-image reads (EXT_CSD,
/// SCR, switch status). The buffer is expected to be mapped uncached.
pub(crate) struct Bringup<'a, P: Platform> {
    host: &'a mut Host<P>,
    io_buf: DmaRegion,
    disable: DeviceType,
}

impl<'a, P: Platform> Bringup<'a, P> {
    pub fn new(host: &'a mut Host<P>, io_buf: DmaRegion, disable: DeviceType) -> Self {
        Self {
            host,
            io_buf,
            disable,
        }
    }

    /// Execute one command without data, returning the response words.
    fn exec(&mut self, word: CmdWord, arg: u32) -> Result<[u32; 4], Error> {
        self.exec_flagged(word, arg, false)
    }

    /// Like [Self::exec], but a failure is a legitimate probe outcome.
    fn probe(&mut self, word: CmdWord, arg: u32) -> Result<[u32; 4], Error> {
        self.exec_flagged(word, arg, true)
    }

    fn exec_flagged(
        &mut self,
        word: CmdWord,
        arg: u32,
        expected_error: bool,
    ) -> Result<[u32; 4], Error> {
        let idx = self.host.queue.create()?;
        let cmd = self.host.queue.cmd_mut(idx);
        cmd.init_arg(word, arg);
        if expected_error {
            cmd.flags = cmd.flags.with_expected_error(true);
        }
        let res = self.host.cmd_exec(idx);
        let resp = self.host.queue.cmd(idx).resp;
        self.host.queue.release(idx);
        res.map(|()| resp)
    }

    /// Execute a command with a data phase into the scratch buffer.
    fn exec_data(&mut self, word: CmdWord, arg: u32, blocksize: u32) -> Result<(), Error> {
        debug_assert!(blocksize as usize <= self.io_buf.len());
        let idx = self.host.queue.create()?;
        self.host
            .queue
            .cmd_mut(idx)
            .init_data(word, arg, self.io_buf.phys(), blocksize);
        let res = self.host.cmd_exec(idx);
        self.host.queue.release(idx);
        res
    }

    /// CMD55-prefixed application command.
    fn app_exec(&mut self, rca: u16, word: CmdWord, arg: u32) -> Result<[u32; 4], Error> {
        self.exec(mmc::CMD55_APP_CMD, (rca as u32) << 16)?;
        self.exec(word, arg)
    }

    /// Poll CMD13 until the card is back in transfer state and ready for
    /// data. A SWITCH_ERROR in the status terminates the negotiation
    /// step immediately.
    fn wait_card_ready(&mut self, rca: u16) -> Result<(), Error> {
        for _ in 0..READY_POLL_MS {
            let resp = self.exec(mmc::CMD13_SEND_STATUS, (rca as u32) << 16)?;
            let st = DeviceStatus::new_with_raw_value(resp[0]);
            if st.switch_error() {
                log::info!("SWITCH rejected by card (status {:#010x})", resp[0]);
                return Err(Error::Card);
            }
            if st.ready() {
                return Ok(());
            }
            self.host.delay_ms(1);
        }
        log::warn!("card did not return to transfer state");
        Err(Error::Io)
    }

    /// Issue tuning commands until the controller reports a sampling
    /// clock lock or gives up.
    fn run_tuning(&mut self, word: CmdWord) -> Result<bool, Error> {
        for _ in 0..TUNING_LOOPS {
            let idx = self.host.queue.create()?;
            self.host.queue.cmd_mut(idx).init_arg(word, 0);
            self.host.cmd_submit_on_avail(idx)?;
            self.host.cmd_wait_cmd_finished(idx, false);
            let status = self.host.queue.cmd(idx).status;
            self.host.queue.release(idx);
            match status {
                CmdStatus::Success => return Ok(true),
                CmdStatus::TuningProgress => self.host.delay_ms(1),
                _ => return Ok(false),
            }
        }
        // The controller never left execute-tuning mode.
        Ok(self.host.tuning_finished().unwrap_or(false))
    }

    /// An SDIO function left running by the firmware can wedge the bus
    /// on iProc boards; poke the CCCR abort register to reset it. Both
    /// probes are expected to fail on a plain memory card.
    fn sdio_reset(&mut self) -> Result<(), Error> {
        let arg = ArgIoRwDirect::new_with_raw_value(0)
            .with_address(u17::new(mmc::SDIO_CCCR_ABORT));
        if self.probe(mmc::CMD52_IO_RW_DIRECT, arg.raw_value()).is_ok() {
            log::warn!("IO_RW_DIRECT (read) succeeded on a memory slot");
            return Err(Error::Io);
        }
        let arg = arg.with_write(true).with_write_data(0x8);
        let _ = self.probe(mmc::CMD52_IO_RW_DIRECT, arg.raw_value());
        Ok(())
    }

    /// Run the complete bring-up.
    pub fn run(mut self) -> Result<DeviceState, Error> {
        if self.host.kind() == ControllerKind::Iproc {
            self.sdio_reset()?;
        }
        self.exec(mmc::CMD0_GO_IDLE_STATE, 0)?;
        self.host.delay_ms(1);

        // SD v2 probe: a card that acknowledges CMD8 echoes the check
        // pattern. No answer means SD v1.x or eMMC.
        let sd_v2 = match self.probe(mmc::CMD8_SEND_IF_COND, mmc::SD_IF_COND_ARG) {
            Ok(resp) => resp[0] & 0xff == 0xaa,
            Err(Error::Card) => false,
            Err(e) => return Err(e),
        };

        if let Some(ocr) = self.sd_power_up(sd_v2)? {
            self.setup_sd(ocr, sd_v2)
        } else {
            let ocr = self.mmc_power_up()?;
            self.setup_mmc(ocr)
        }
    }

    /// ACMD41 loop. Returns `None` when the card rejects APP_CMD, which
    /// means the medium is not SD.
    fn sd_power_up(&mut self, sd_v2: bool) -> Result<Option<Ocr>, Error> {
        let mut arg = Ocr::new_with_raw_value(0).with_voltage_window(Ocr::host_window());
        if sd_v2 {
            // Sector addressing and, since every UHS mode runs at 1.8 V,
            // the low-voltage request.
            arg = arg.with_sector_mode(true).with_v18_request(true);
        }

        for i in 0..POWER_UP_MS / POWER_UP_STEP_MS {
            if i == 0 && self.probe(mmc::CMD55_APP_CMD, 0).is_err() {
                return Ok(None);
            } else if i != 0 {
                self.exec(mmc::CMD55_APP_CMD, 0)?;
            }
            let resp = self.exec(mmc::ACMD41_SD_SEND_OP_COND, arg.raw_value())?;
            let ocr = Ocr::new_with_raw_value(resp[0]);
            if ocr.powered_up() {
                log::info!(
                    "SD card powered up, {}",
                    if ocr.sector_mode() {
                        "sector addressing (SDHC/SDXC)"
                    } else {
                        "byte addressing"
                    }
                );
                return Ok(Some(ocr));
            }
            self.host.delay_ms(POWER_UP_STEP_MS);
        }
        log::warn!("SD power-up loop exhausted");
        Err(Error::Negotiation)
    }

    /// CMD1 loop with a sector-mode request.
    fn mmc_power_up(&mut self) -> Result<Ocr, Error> {
        for _ in 0..POWER_UP_MS / POWER_UP_STEP_MS {
            let resp = self.probe(mmc::CMD1_SEND_OP_COND, mmc::MMC_OP_COND_ARG)?;
            let ocr = Ocr::new_with_raw_value(resp[0]);
            if ocr.powered_up() {
                log::info!("eMMC powered up");
                return Ok(ocr);
            }
            self.host.delay_ms(POWER_UP_STEP_MS);
        }
        log::warn!("eMMC power-up loop exhausted");
        Err(Error::Negotiation)
    }

    fn identify(
        &mut self,
        medium: MediumType,
    ) -> Result<(Cid, u16, Csd), Error> {
        let cid = Cid::new(self.exec(mmc::CMD2_ALL_SEND_CID, 0)?);

        let rca = if medium == MediumType::Sd {
            let resp = self.exec(mmc::CMD3_SEND_RELATIVE_ADDR, 0)?;
            (resp[0] >> 16) as u16
        } else {
            let rca = 1u16;
            self.exec(mmc::CMD3_SET_RELATIVE_ADDR, (rca as u32) << 16)?;
            rca
        };

        let csd = Csd::new(self.exec(mmc::CMD9_SEND_CSD, (rca as u32) << 16)?);
        self.exec(mmc::CMD7_SELECT_CARD, (rca as u32) << 16)?;
        Ok((cid, rca, csd))
    }

    fn setup_sd(&mut self, ocr: Ocr, sd_v2: bool) -> Result<DeviceState, Error> {
        let (cid, rca, csd) = self.identify(MediumType::Sd)?;
        let num_sectors = csd.capacity_bytes() / mmc::SECTOR_SIZE as u64;
        let addr_mult = if ocr.sector_mode() {
            1
        } else {
            mmc::SECTOR_SIZE as u64
        };

        // SCR: bus width and CMD23 capability live there.
        self.exec(mmc::CMD55_APP_CMD, (rca as u32) << 16)?;
        self.exec_data(mmc::ACMD51_SEND_SCR, 0, 8)?;
        let scr = unsafe { self.io_buf.as_slice() };
        let four_bit = scr[1] & 0x04 != 0;
        let has_cmd23 = scr[3] & 0x02 != 0;

        let mut bus = BusWidth::One;
        if four_bit {
            self.app_exec(rca, mmc::ACMD6_SET_BUS_WIDTH, 2)?;
            self.host.set_bus_width(BusWidth::Four);
            bus = BusWidth::Four;
        }

        let (timing, frequency) = self.negotiate_sd(rca, sd_v2)?;
        let voltage = if timing.needs_1v8() {
            Voltage::V18
        } else {
            Voltage::V33
        };

        let state = DeviceState {
            medium: MediumType::Sd,
            rca,
            num_sectors,
            addr_mult,
            cid,
            csd,
            has_cmd23,
            timing,
            bus_width: bus,
            frequency,
            voltage,
            mmc: None,
            hid: hid_string(&cid, cid.serial_sd(), 5),
        };
        log::info!(
            "SD card '{}': {} sectors, {} at {} Hz, {}-bit",
            state.hid,
            state.num_sectors,
            timing.name(),
            frequency.raw(),
            bus.bits()
        );
        Ok(state)
    }

    /// SD timing negotiation, best mode first. SD v1 cards know no CMD6,
    /// they settle on SDR25-class clocking directly.
    fn negotiate_sd(&mut self, rca: u16, sd_v2: bool) -> Result<(Timing, Hertz), Error> {
        if !sd_v2 {
            let freq = Hertz::from_raw(50_000_000);
            self.host.set_clock_and_timing(freq, Timing::UhsSdr25, false)?;
            self.wait_card_ready(rca)?;
            return Ok((Timing::UhsSdr25, freq));
        }

        let candidates: [(Timing, u32, u32); 5] = [
            (Timing::UhsSdr104, 208_000_000, sd_switch::SDR104),
            (Timing::UhsSdr50, 100_000_000, sd_switch::SDR50),
            (Timing::UhsDdr50, 50_000_000, sd_switch::DDR50),
            (Timing::UhsSdr25, 50_000_000, sd_switch::SDR25),
            (Timing::UhsSdr12, 25_000_000, sd_switch::SDR12),
        ];

        for (timing, freq, function) in candidates {
            if !self.host.supports_timing(timing) {
                continue;
            }
            match self.try_sd_mode(rca, timing, Hertz::from_raw(freq), function) {
                Ok(()) => return Ok((timing, Hertz::from_raw(freq))),
                Err(Error::Card) | Err(Error::Io) => {
                    log::info!("{} not usable, trying next", timing.name());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        log::warn!("no SD operating point left");
        Err(Error::Negotiation)
    }

    fn try_sd_mode(
        &mut self,
        rca: u16,
        timing: Timing,
        freq: Hertz,
        function: u32,
    ) -> Result<(), Error> {
        // CMD6 with a 64-byte switch status read; group 1 selection in
        // the response tells whether the card accepted the function.
        self.exec_data(
            mmc::CMD6_SWITCH_FUNC,
            mmc::SD_SWITCH_SET | function,
            64,
        )?;
        let status = unsafe { self.io_buf.as_slice() };
        let selected = status[16] & 0xf;
        if selected as u32 != function & 0xf {
            log::info!("card declined switch to {}", timing.name());
            return Err(Error::Card);
        }

        if timing.needs_1v8() {
            self.host.set_voltage(Voltage::V18);
            self.host.delay_ms(VOLTAGE_DELAY_MS);
        }
        self.host.set_clock_and_timing(freq, timing, false)?;

        if timing.needs_tuning() && !self.run_tuning(mmc::CMD19_SEND_TUNING_BLOCK)? {
            log::info!("tuning failed for {}", timing.name());
            return Err(Error::Card);
        }

        self.wait_card_ready(rca)
    }

    fn setup_mmc(&mut self, ocr: Ocr) -> Result<DeviceState, Error> {
        let (cid, rca, csd) = self.identify(MediumType::Mmc)?;
        let addr_mult = if ocr.sector_mode() {
            1
        } else {
            mmc::SECTOR_SIZE as u64
        };

        let ecsd = self.read_ext_csd()?;
        let num_sectors = ecsd.sec_count() as u64;
        let supported = ecsd.device_type();
        let usable = supported.without(self.disable);
        log::info!(
            "EXT_CSD rev {}: device types {:#04x} (usable {:#04x}), strobe {}",
            ecsd.rev(),
            supported.raw_value(),
            usable.raw_value(),
            ecsd.strobe_support()
        );

        let width = if self.host.supports_8bit() {
            BusWidth::Eight
        } else {
            BusWidth::Four
        };

        let mut chosen = None;
        for mode in MmcMode::ALL {
            if !self.mode_applicable(mode, usable, ecsd.strobe_support(), width) {
                continue;
            }
            match self.try_mmc_mode(rca, mode, width) {
                Ok(()) => {
                    chosen = Some(mode);
                    break;
                }
                Err(Error::Card) | Err(Error::Io) => {
                    log::info!("{} not usable, trying next", mode.name());
                    self.mmc_fallback_to_compat(rca);
                }
                Err(e) => return Err(e),
            }
        }
        let Some(mode) = chosen else {
            log::warn!("no eMMC operating point left");
            return Err(Error::Negotiation);
        };

        // Verification: the card must report the switched timing.
        let ecsd = self.read_ext_csd()?;
        let expected = match mode {
            MmcMode::Hs400Es | MmcMode::Hs400 => hs_timing::HS400,
            MmcMode::Hs200 => hs_timing::HS200,
            MmcMode::Ddr52 | MmcMode::Hs52 => hs_timing::HIGH_SPEED,
            MmcMode::Hs26 => hs_timing::COMPATIBLE,
        };
        if ecsd.hs_timing() != expected {
            log::warn!(
                "EXT_CSD reports timing {} after switching to {}",
                ecsd.hs_timing(),
                mode.name()
            );
            return Err(Error::Negotiation);
        }

        let timing = mode.timing();
        let state = DeviceState {
            medium: MediumType::Mmc,
            rca,
            num_sectors,
            addr_mult,
            cid,
            csd,
            has_cmd23: true,
            timing,
            bus_width: width,
            frequency: mode.frequency(),
            voltage: if timing.needs_1v8() {
                Voltage::V18
            } else {
                Voltage::V33
            },
            mmc: Some(MmcState {
                device_type_supported: supported,
                device_type_selected: mode.selected_bits(),
                enh_strobe: mode == MmcMode::Hs400Es,
                rev: ecsd.rev(),
                size_user: num_sectors * mmc::SECTOR_SIZE as u64,
                size_boot: ecsd.boot_partition_size(),
                size_rpmb: ecsd.rpmb_size(),
            }),
            hid: hid_string(&cid, cid.serial_mmc(), 6),
        };
        log::info!(
            "eMMC '{}': {} sectors, {} at {} Hz, {}-bit",
            state.hid,
            state.num_sectors,
            timing.name(),
            state.frequency.raw(),
            width.bits()
        );
        Ok(state)
    }

    fn read_ext_csd(&mut self) -> Result<ExtCsd, Error> {
        self.exec_data(mmc::CMD8_SEND_EXT_CSD, 0, 512)?;
        let mut data = [0u8; 512];
        data.copy_from_slice(&unsafe { self.io_buf.as_slice() }[..512]);
        Ok(ExtCsd::new(data))
    }

    fn mode_applicable(
        &mut self,
        mode: MmcMode,
        usable: DeviceType,
        strobe: bool,
        width: BusWidth,
    ) -> bool {
        let card_ok = match mode {
            MmcMode::Hs400Es => usable.hs400() && strobe,
            MmcMode::Hs400 => usable.hs400(),
            MmcMode::Hs200 => usable.hs200(),
            MmcMode::Ddr52 => usable.hs52_ddr(),
            MmcMode::Hs52 => usable.hs52(),
            MmcMode::Hs26 => usable.hs26(),
        };
        // HS400 is specified for the 8-bit bus only.
        let width_ok = !matches!(mode, MmcMode::Hs400Es | MmcMode::Hs400)
            || width == BusWidth::Eight;
        card_ok && width_ok && self.host.supports_timing(mode.timing())
    }

    /// CMD6 byte write into the EXT_CSD with a CMD13 ready poll.
    fn mmc_switch(&mut self, rca: u16, index: u8, value: u8) -> Result<(), Error> {
        self.exec(mmc::CMD6_SWITCH, mmc::mmc_switch_arg(index, value))?;
        self.wait_card_ready(rca)
    }

    /// Switch one eMMC mode, from the card's current compatible state.
    fn try_mmc_mode(&mut self, rca: u16, mode: MmcMode, width: BusWidth) -> Result<(), Error> {
        let timing = mode.timing();
        let width_value = match width {
            BusWidth::One => bus_width::W1,
            BusWidth::Four => bus_width::W4,
            BusWidth::Eight => bus_width::W8,
        };
        let ddr_width_value = match width {
            BusWidth::Eight => bus_width::W8_DDR,
            _ => bus_width::W4_DDR,
        };

        if timing.needs_1v8() {
            self.host.set_voltage(Voltage::V18);
            self.host.delay_ms(VOLTAGE_DELAY_MS);
        }

        match mode {
            MmcMode::Hs26 => {
                self.mmc_switch(rca, mmc::ext_csd::BUS_WIDTH as u8, width_value)?;
                self.host.set_bus_width(width);
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::Legacy, false)?;
            }
            MmcMode::Hs52 => {
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HIGH_SPEED)?;
                self.mmc_switch(rca, mmc::ext_csd::BUS_WIDTH as u8, width_value)?;
                self.host.set_bus_width(width);
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::HighSpeed, false)?;
            }
            MmcMode::Ddr52 => {
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HIGH_SPEED)?;
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::HighSpeed, false)?;
                self.mmc_switch(rca, mmc::ext_csd::BUS_WIDTH as u8, ddr_width_value)?;
                self.host.set_bus_width(width);
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::MmcDdr52, false)?;
            }
            MmcMode::Hs200 => {
                self.mmc_switch(rca, mmc::ext_csd::BUS_WIDTH as u8, width_value)?;
                self.host.set_bus_width(width);
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HS200)?;
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::MmcHs200, false)?;
                if !self.run_tuning(mmc::CMD21_SEND_TUNING_BLOCK)? {
                    log::info!("HS200 tuning failed");
                    return Err(Error::Card);
                }
                self.wait_card_ready(rca)?;
            }
            MmcMode::Hs400 => {
                // HS400 is entered through a tuned HS200 point, dropped
                // to high speed for the DDR width switch.
                self.try_mmc_mode(rca, MmcMode::Hs200, width)?;
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HIGH_SPEED)?;
                self.host
                    .set_clock_and_timing(Hertz::from_raw(52_000_000), Timing::HighSpeed, false)?;
                self.mmc_switch(rca, mmc::ext_csd::BUS_WIDTH as u8, ddr_width_value)?;
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HS400)?;
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::MmcHs400, false)?;
                self.wait_card_ready(rca)?;
            }
            MmcMode::Hs400Es => {
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HIGH_SPEED)?;
                self.host
                    .set_clock_and_timing(Hertz::from_raw(52_000_000), Timing::HighSpeed, false)?;
                self.mmc_switch(
                    rca,
                    mmc::ext_csd::BUS_WIDTH as u8,
                    ddr_width_value | bus_width::ENHANCED_STROBE,
                )?;
                self.host.set_bus_width(width);
                self.mmc_switch(rca, mmc::ext_csd::HS_TIMING as u8, hs_timing::HS400)?;
                self.host
                    .set_clock_and_timing(mode.frequency(), Timing::MmcHs400, true)?;
                self.wait_card_ready(rca)?;
            }
        }
        Ok(())
    }

    /// Best-effort return to the compatible state after a failed
    /// negotiation step, so the next candidate starts from known ground.
    fn mmc_fallback_to_compat(&mut self, rca: u16) {
        let _ = self
            .host
            .set_clock_and_timing(Hertz::from_raw(26_000_000), Timing::Legacy, false);
        let _ = self.exec(
            mmc::CMD6_SWITCH,
            mmc::mmc_switch_arg(mmc::ext_csd::HS_TIMING as u8, hs_timing::COMPATIBLE),
        );
        let _ = self.wait_card_ready(rca);
    }
}

/// Assemble the HID the multiplexer matches against: the printable
/// product name followed by the serial number.
fn hid_string(cid: &Cid, serial: u32, name_len: usize) -> String {
    let mut hid = String::new();
    for &c in cid.product_name().iter().take(name_len) {
        if c.is_ascii_graphic() {
            hid.push(c as char);
        } else {
            hid.push('_');
        }
    }
    let _ = write!(hid, "-{serial:08x}");
    hid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmc_mode_preference_order() {
        assert_eq!(MmcMode::ALL[0], MmcMode::Hs400Es);
        assert_eq!(MmcMode::ALL[5], MmcMode::Hs26);
        assert_eq!(MmcMode::Hs200.timing(), Timing::MmcHs200);
        assert_eq!(MmcMode::Hs200.frequency().raw(), 200_000_000);
        assert_eq!(MmcMode::Ddr52.frequency().raw(), 52_000_000);
        assert!(MmcMode::Hs400Es.selected_bits().hs400());
    }

    #[test]
    fn hid_from_cid() {
        // Product name "PROD01", serial 0xdeadbeef.
        let mut resp = [0u32; 4];
        for (i, c) in b"PROD01".iter().enumerate() {
            let hi = 103 - 8 * i as u32;
            let lo = hi - 7;
            // Place the byte into the response image.
            let word = 3 - (lo / 32) as usize;
            resp[word] |= (*c as u32) << (lo % 32);
        }
        let cid = Cid::new(resp);
        assert_eq!(&cid.product_name(), b"PROD01");
        let hid = hid_string(&cid, 0xdead_beef, 6);
        assert_eq!(hid, "PROD01-deadbeef");
    }

    #[test]
    fn device_state_capacity() {
        let state = DeviceState {
            medium: MediumType::Sd,
            rca: 0xaaaa,
            num_sectors: 1000,
            addr_mult: 1,
            cid: Cid::default(),
            csd: Csd::default(),
            has_cmd23: false,
            timing: Timing::UhsSdr25,
            bus_width: BusWidth::Four,
            frequency: Hertz::from_raw(50_000_000),
            voltage: Voltage::V33,
            mmc: None,
            hid: String::new(),
        };
        assert_eq!(state.capacity(), 512_000);
    }
}
