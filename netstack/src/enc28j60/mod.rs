//! Register-level driver for the Microchip ENC28J60 SPI Ethernet controller
//!
//! The chip exposes banked control registers, an 8 KiB buffer memory that is
//! split into a receive ring and a transmit window, and PHY registers reached
//! indirectly through the MII interface. This module owns the register
//! protocol and the ring bookkeeping; policy (filter level, watchdog, resets)
//! lives in [`crate::link`].

pub mod regs;
pub mod ring;

#[cfg(test)]
pub mod mock;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{NetError, Result};
use crate::hal::{Clock, SpiDevice};
use crate::net::ethernet::MacAddress;
use regs::*;
use ring::RxRing;

/// MISTAT.BUSY polls before a PHY access is declared failed.
const PHY_BUSY_POLLS: u32 = 1000;
/// ECON1.TXRTS polls before a transmission is abandoned.
const TX_POLL_LIMIT: u32 = 2000;
/// PKTDEC pulses when draining the packet counter during resync.
const PKTDEC_LIMIT: u32 = 256;
const CLKRDY_WAIT_MS: u32 = 10;
const CRC_LEN: u16 = 4;

/// Interrupt sources enabled while the driver runs.
pub const ENABLED_INTERRUPTS: Eie = Eie::INTIE
    .union(Eie::PKTIE)
    .union(Eie::LINKIE)
    .union(Eie::TXERIE)
    .union(Eie::RXERIE);

/// How much traffic the hardware receive filter lets through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterLevel {
    /// Unicast, multicast and broadcast
    Open,
    /// Unicast plus ARP broadcasts
    BroadcastLimited,
    UnicastOnly,
}

impl FilterLevel {
    pub fn erxfcon(self) -> Erxfcon {
        match self {
            FilterLevel::Open => Erxfcon::UCEN | Erxfcon::CRCEN | Erxfcon::MCEN | Erxfcon::BCEN,
            FilterLevel::BroadcastLimited => Erxfcon::UCEN | Erxfcon::CRCEN | Erxfcon::PMEN,
            FilterLevel::UnicastOnly => Erxfcon::UCEN | Erxfcon::CRCEN,
        }
    }
}

/// Result of reading one entry from the receive ring.
#[derive(Debug, PartialEq, Eq)]
pub enum RxOutcome {
    /// A good frame, without the trailing CRC
    Frame(Vec<u8>),
    /// Frame flagged bad by the receive status vector and skipped
    Dropped(RxStatus),
    /// Header was inconsistent; the ring was resynchronized to the write pointer
    Resync,
    Empty,
}

pub struct Enc28j60<S: SpiDevice> {
    spi: S,
    /// Cached ECON1.BSEL; `None` forces the next access to reselect
    bank: Option<u8>,
    ring: RxRing,
    mac: MacAddress,
    filter: FilterLevel,
    revision: u8,
}

impl<S: SpiDevice> Enc28j60<S> {
    pub fn new(spi: S) -> Self {
        Enc28j60 {
            spi,
            bank: None,
            ring: RxRing::default(),
            mac: MacAddress::ZERO,
            filter: FilterLevel::Open,
            revision: 0,
        }
    }

    pub fn release(self) -> S {
        self.spi
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac
    }

    pub fn filter(&self) -> FilterLevel {
        self.filter
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn ring(&self) -> &RxRing {
        &self.ring
    }

    fn select_bank(&mut self, bank: Bank) -> Result<()> {
        let bits = match bank.select_bits() {
            Some(bits) => bits,
            None => return Ok(()),
        };
        if self.bank == Some(bits) {
            return Ok(());
        }
        self.op(OP_BIT_CLEAR, ECON1.addr, (Econ1::BSEL1 | Econ1::BSEL0).bits())?;
        if bits != 0 {
            self.op(OP_BIT_SET, ECON1.addr, bits)?;
        }
        self.bank = Some(bits);
        Ok(())
    }

    fn op(&mut self, opcode: u8, addr: u8, data: u8) -> Result<()> {
        self.spi.transaction(&[opcode | (addr & ADDR_MASK), data], &mut [])
    }

    pub fn read_reg(&mut self, reg: Register) -> Result<u8> {
        self.select_bank(reg.bank)?;
        let mut read = [0u8; 2];
        let len = if reg.mac_mii { 2 } else { 1 };
        self.spi
            .transaction(&[OP_READ_CTRL | (reg.addr & ADDR_MASK)], &mut read[..len])?;
        Ok(read[len - 1])
    }

    pub fn write_reg(&mut self, reg: Register, value: u8) -> Result<()> {
        self.select_bank(reg.bank)?;
        self.op(OP_WRITE_CTRL, reg.addr, value)
    }

    /// Reads a low/high register pair, low byte first.
    pub fn read_reg16(&mut self, reg: Register) -> Result<u16> {
        let low = self.read_reg(reg)?;
        let high = self.read_reg(reg.high())?;
        Ok(u16::from_le_bytes([low, high]))
    }

    /// Writes a low/high register pair, low byte first. ERXRDPT only
    /// latches on the high byte write.
    pub fn write_reg16(&mut self, reg: Register, value: u16) -> Result<()> {
        let [low, high] = value.to_le_bytes();
        self.write_reg(reg, low)?;
        self.write_reg(reg.high(), high)
    }

    /// Bit field set; only valid for ETH registers.
    pub fn bit_set(&mut self, reg: Register, mask: u8) -> Result<()> {
        self.select_bank(reg.bank)?;
        self.op(OP_BIT_SET, reg.addr, mask)
    }

    pub fn bit_clear(&mut self, reg: Register, mask: u8) -> Result<()> {
        self.select_bank(reg.bank)?;
        self.op(OP_BIT_CLEAR, reg.addr, mask)
    }

    /// Reads buffer memory at ERDPT; the chip wraps at ERXND.
    pub fn read_buffer(&mut self, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.spi.transaction(&[OP_READ_BUF], out)
    }

    pub fn write_buffer(&mut self, data: &[u8]) -> Result<()> {
        let mut command = Vec::with_capacity(data.len() + 1);
        command.push(OP_WRITE_BUF);
        command.extend_from_slice(data);
        self.spi.transaction(&command, &mut [])
    }

    fn wait_mii_idle(&mut self) -> Result<()> {
        for _ in 0..PHY_BUSY_POLLS {
            if self.read_reg(MISTAT)? & MISTAT_BUSY == 0 {
                return Ok(());
            }
        }
        log::warn!("enc28j60: MII interface stuck busy");
        Err(NetError::HardwareFault)
    }

    pub fn read_phy(&mut self, reg: u8) -> Result<u16> {
        self.write_reg(MIREGADR, reg)?;
        self.write_reg(MICMD, MICMD_MIIRD)?;
        self.wait_mii_idle()?;
        self.write_reg(MICMD, 0)?;
        let low = self.read_reg(MIRDL)?;
        let high = self.read_reg(MIRDH)?;
        Ok(u16::from_le_bytes([low, high]))
    }

    pub fn write_phy(&mut self, reg: u8, value: u16) -> Result<()> {
        let [low, high] = value.to_le_bytes();
        self.write_reg(MIREGADR, reg)?;
        self.write_reg(MIWRL, low)?;
        // Writing MIWRH starts the MII transaction
        self.write_reg(MIWRH, high)?;
        self.wait_mii_idle()
    }

    /// Issues the soft reset command and waits for the oscillator.
    pub fn soft_reset(&mut self, clock: &dyn Clock) -> Result<()> {
        self.spi.transaction(&[OP_SOFT_RESET], &mut [])?;
        self.bank = None;
        // CLKRDY reads set too early on some revisions (errata 2), so always wait.
        clock.delay_ms(1);
        for _ in 0..CLKRDY_WAIT_MS {
            if Estat::from_bits_retain(self.read_reg(ESTAT)?).contains(Estat::CLKRDY) {
                return Ok(());
            }
            clock.delay_ms(1);
        }
        Err(NetError::ChipNotResponding)
    }

    /// Resets the chip and configures buffers, MAC, PHY and interrupts.
    pub fn init(&mut self, mac: MacAddress, clock: &dyn Clock) -> Result<()> {
        self.soft_reset(clock)?;

        let revision = self.read_reg(EREVID)?;
        if !revision_valid(revision) {
            log::error!("enc28j60: bad revision register {:#04x}", revision);
            return Err(NetError::ChipNotResponding);
        }
        self.revision = revision;

        self.init_receive_buffer()?;
        self.write_reg16(ETXST, TXSTART)?;
        self.write_reg16(ETXND, TXSTART)?;

        self.write_reg16(EPMO, 0)?;
        self.write_reg(EPMM0, ARP_PATTERN_MASK[0])?;
        self.write_reg(EPMM1, ARP_PATTERN_MASK[1])?;
        self.write_reg16(EPMCS, ARP_PATTERN_CHECKSUM)?;
        self.set_filter(FilterLevel::Open)?;

        self.write_reg(MACON1, (Macon1::MARXEN | Macon1::TXPAUS | Macon1::RXPAUS).bits())?;
        self.write_reg(
            MACON3,
            (Macon3::PADCFG0 | Macon3::TXCRCEN | Macon3::FRMLNEN | Macon3::FULDPX).bits(),
        )?;
        self.write_reg(MACON4, 0)?;
        self.write_reg16(MAMXFL, MAX_FRAME_LEN)?;
        self.write_reg(MABBIPG, MABBIPG_FULL_DUPLEX)?;
        self.write_reg(MAIPGL, MAIPGL_DEFAULT)?;
        self.write_reg(MAIPGH, 0x0C)?;

        for (reg, byte) in MAC_ADDRESS_REGS.iter().zip(mac.as_bytes()) {
            self.write_reg(*reg, *byte)?;
        }
        self.mac = mac;

        self.write_phy(PHCON1, PHCON1_PDPXMD)?;
        self.write_phy(PHCON2, PHCON2_HDLDIS)?;
        self.write_phy(PHLCON, PHLCON_LEDS)?;
        self.write_phy(PHIE, PHIE_PGEIE | PHIE_PLNKIE)?;

        self.bit_set(ECON2, Econ2::AUTOINC.bits())?;
        self.bit_clear(EIR, Eir::all().bits())?;
        self.write_reg(EIE, ENABLED_INTERRUPTS.bits())?;
        self.bit_set(ECON1, Econ1::RXEN.bits())?;

        log::info!("enc28j60: revision {} initialized, MAC {}", revision, mac);
        Ok(())
    }

    fn init_receive_buffer(&mut self) -> Result<()> {
        self.ring.reset();
        // Writing ERXST also moves the hardware write pointer to it
        self.write_reg16(ERXST, self.ring.start())?;
        self.write_reg16(ERXND, self.ring.end())?;
        self.write_reg16(ERDPT, self.ring.start())?;
        let release = self.ring.release_pointer();
        self.write_reg16(ERXRDPT, release)
    }

    pub fn set_filter(&mut self, level: FilterLevel) -> Result<()> {
        self.write_reg(ERXFCON, level.erxfcon().bits())?;
        if level != self.filter {
            log::debug!("enc28j60: receive filter {:?} -> {:?}", self.filter, level);
        }
        self.filter = level;
        Ok(())
    }

    pub fn link_up(&mut self) -> Result<bool> {
        Ok(self.read_phy(PHSTAT2)? & PHSTAT2_LSTAT != 0)
    }

    /// Reading PHIR acknowledges the PHY interrupt behind EIR.LINKIF.
    pub fn clear_link_interrupt(&mut self) -> Result<()> {
        self.read_phy(PHIR).map(|_| ())
    }

    pub fn packet_count(&mut self) -> Result<u8> {
        self.read_reg(EPKTCNT)
    }

    pub fn interrupt_flags(&mut self) -> Result<Eir> {
        Ok(Eir::from_bits_retain(self.read_reg(EIR)?))
    }

    pub fn clear_flags(&mut self, flags: Eir) -> Result<()> {
        self.bit_clear(EIR, flags.bits())
    }

    pub fn enable_interrupts(&mut self) -> Result<()> {
        self.bit_set(EIE, Eie::INTIE.bits())
    }

    pub fn disable_interrupts(&mut self) -> Result<()> {
        self.bit_clear(EIE, Eie::INTIE.bits())
    }

    /// Re-reads ECON1 so the cached bank matches the chip again.
    pub fn sync_bank(&mut self) -> Result<()> {
        let econ1 = self.read_reg(ECON1)?;
        self.bank = Some(econ1 & (Econ1::BSEL1 | Econ1::BSEL0).bits());
        Ok(())
    }

    /// Sends one frame. Returns `Ok(false)` when the controller reported a
    /// transmit error or never finished; the TX logic is reset in that case.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<bool> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN as usize {
            return Err(NetError::Malformed("frame length"));
        }

        // Errata 12: reset the transmit logic before every send
        self.bit_set(ECON1, Econ1::TXRST.bits())?;
        self.bit_clear(ECON1, Econ1::TXRST.bits())?;
        self.bit_clear(EIR, (Eir::TXERIF | Eir::TXIF).bits())?;

        self.write_reg16(EWRPT, TXSTART)?;
        let mut data = Vec::with_capacity(frame.len() + 1);
        // Per-packet control byte: use MACON3 defaults
        data.push(0x00);
        data.extend_from_slice(frame);
        self.write_buffer(&data)?;
        self.write_reg16(ETXND, TXSTART + frame.len() as u16)?;

        self.bit_set(ECON1, Econ1::TXRTS.bits())?;
        for _ in 0..TX_POLL_LIMIT {
            let econ1 = Econ1::from_bits_retain(self.read_reg(ECON1)?);
            if econ1.contains(Econ1::TXRTS) {
                continue;
            }
            let eir = self.interrupt_flags()?;
            if eir.contains(Eir::TXERIF) {
                log::warn!("enc28j60: transmit error, resetting TX logic");
                self.recover_transmitter()?;
                return Ok(false);
            }
            return Ok(true);
        }

        log::warn!("enc28j60: transmit timed out");
        self.recover_transmitter()?;
        Ok(false)
    }

    fn recover_transmitter(&mut self) -> Result<()> {
        self.bit_clear(ECON1, Econ1::TXRTS.bits())?;
        self.bit_set(ECON1, Econ1::TXRST.bits())?;
        self.bit_clear(ECON1, Econ1::TXRST.bits())?;
        self.bit_clear(EIR, (Eir::TXERIF | Eir::TXIF).bits())
    }

    /// Reads the next frame from the ring and releases its space.
    pub fn receive(&mut self) -> Result<RxOutcome> {
        // EPKTCNT is authoritative; PKTIF is unreliable (errata 6)
        if self.packet_count()? == 0 {
            return Ok(RxOutcome::Empty);
        }

        self.write_reg16(ERDPT, self.ring.next())?;
        let mut header = [0u8; RX_HEADER_LEN];
        self.read_buffer(&mut header)?;
        let next = u16::from_le_bytes([header[0], header[1]]);
        let byte_count = u16::from_le_bytes([header[2], header[3]]);
        let status = RxStatus::from_bits_retain(u16::from_le_bytes([header[4], header[5]]));

        if !self.ring.validate_next(next)
            || next != self.entry_end(byte_count)
            || byte_count > MAX_FRAME_LEN
            || byte_count < MIN_FRAME_LEN + CRC_LEN
            || status.contains(RxStatus::ZERO)
        {
            log::warn!(
                "enc28j60: corrupt RX header next={:#06x} len={} status={:#06x}",
                next,
                byte_count,
                status.bits()
            );
            self.resync()?;
            return Ok(RxOutcome::Resync);
        }

        let outcome = if !status.contains(RxStatus::RECEIVED_OK)
            || status.intersects(RxStatus::CRC_ERROR | RxStatus::UNKNOWN_OPCODE)
        {
            log::trace!("enc28j60: dropping frame status={:#06x}", status.bits());
            RxOutcome::Dropped(status)
        } else {
            let mut frame = vec![0u8; (byte_count - CRC_LEN) as usize];
            self.read_buffer(&mut frame)?;
            RxOutcome::Frame(frame)
        };

        self.ring.advance(next);
        self.release_consumed()?;
        Ok(outcome)
    }

    /// Where the hardware puts the header after an entry of `byte_count`
    /// bytes starting at the read cursor: past the header and frame, rounded
    /// up to an even address.
    fn entry_end(&self, byte_count: u16) -> u16 {
        let end = self.ring.offset(self.ring.next(), RX_HEADER_LEN as u16 + byte_count);
        if end % 2 == 1 {
            self.ring.offset(end, 1)
        } else {
            end
        }
    }

    fn release_consumed(&mut self) -> Result<()> {
        let release = self.ring.release_pointer();
        self.write_reg16(ERXRDPT, release)?;
        self.bit_set(ECON2, Econ2::PKTDEC.bits())
    }

    /// Drops everything in the ring: the read cursor jumps to the hardware
    /// write pointer and the packet counter is drained to zero.
    pub fn resync(&mut self) -> Result<()> {
        let write_ptr = self.read_reg16(ERXWRPT)?;
        let target = if self.ring.validate_next(write_ptr) {
            log::debug!("enc28j60: discarding {} ring bytes", self.ring.used(write_ptr));
            write_ptr
        } else {
            self.ring.start()
        };
        self.ring.advance(target);
        let release = self.ring.release_pointer();
        self.write_reg16(ERXRDPT, release)?;
        self.drain_packet_count()
    }

    fn drain_packet_count(&mut self) -> Result<()> {
        for _ in 0..PKTDEC_LIMIT {
            if self.packet_count()? == 0 {
                return Ok(());
            }
            self.bit_set(ECON2, Econ2::PKTDEC.bits())?;
        }
        Err(NetError::HardwareFault)
    }

    /// Restarts only the receive logic and empties the ring.
    pub fn reset_receiver(&mut self) -> Result<()> {
        self.bit_clear(ECON1, Econ1::RXEN.bits())?;
        self.bit_set(ECON1, Econ1::RXRST.bits())?;
        self.bit_clear(ECON1, Econ1::RXRST.bits())?;
        self.init_receive_buffer()?;
        self.drain_packet_count()?;
        self.bit_clear(EIR, (Eir::PKTIF | Eir::RXERIF).bits())?;
        self.write_reg(ERXFCON, self.filter.erxfcon().bits())?;
        self.bit_set(ECON1, Econ1::RXEN.bits())
    }

    /// Rewrites interrupt enables, receive enable and the filter when they
    /// have drifted. Returns whether anything needed fixing.
    pub fn repair_registers(&mut self) -> Result<bool> {
        let mut repaired = false;

        let eie = Eie::from_bits_retain(self.read_reg(EIE)?);
        if eie != ENABLED_INTERRUPTS {
            log::warn!("enc28j60: EIE drifted to {:#04x}", eie.bits());
            self.write_reg(EIE, ENABLED_INTERRUPTS.bits())?;
            repaired = true;
        }

        let econ1 = Econ1::from_bits_retain(self.read_reg(ECON1)?);
        if !econ1.contains(Econ1::RXEN) {
            log::warn!("enc28j60: receive was disabled");
            self.bit_set(ECON1, Econ1::RXEN.bits())?;
            repaired = true;
        }

        let erxfcon = self.read_reg(ERXFCON)?;
        if erxfcon != self.filter.erxfcon().bits() {
            log::warn!("enc28j60: ERXFCON drifted to {:#04x}", erxfcon);
            self.write_reg(ERXFCON, self.filter.erxfcon().bits())?;
            repaired = true;
        }

        Ok(repaired)
    }
}

#[cfg(test)]
mod tests;
