// In-memory ENC28J60 model answering the SPI instruction set
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::regs::*;
use crate::error::{NetError, Result};
use crate::hal::SpiDevice;

pub struct ChipModel {
    banks: [[u8; 0x1B]; 4],
    common: [u8; 5],
    pub memory: Vec<u8>,
    pub phy: [u16; 0x20],
    pub revision: u8,
    pub link: bool,
    pub sent: Vec<Vec<u8>>,
    pub resets: u32,
    /// Next transmission raises TXERIF instead of completing
    pub fail_next_tx: bool,
    /// TXRTS never clears
    pub tx_stuck: bool,
    /// Every transaction fails
    pub bus_error: bool,
}

impl ChipModel {
    pub fn new() -> Self {
        let mut chip = ChipModel {
            banks: [[0; 0x1B]; 4],
            common: [0; 5],
            memory: vec![0; BUFFER_SIZE as usize],
            phy: [0; 0x20],
            revision: 6,
            link: true,
            sent: Vec::new(),
            resets: 0,
            fail_next_tx: false,
            tx_stuck: false,
            bus_error: false,
        };
        chip.power_on();
        chip
    }

    fn power_on(&mut self) {
        self.banks = [[0; 0x1B]; 4];
        self.common = [0; 5];
        self.set_common(ESTAT.addr, Estat::CLKRDY.bits());
        self.set_common(ECON2.addr, Econ2::AUTOINC.bits());
        self.banks[0][ERXND.addr as usize] = 0xFF;
        self.banks[0][ERXND.addr as usize + 1] = 0x1F;
        self.banks[3][EREVID.addr as usize] = self.revision;
    }

    fn common_index(addr: u8) -> usize {
        (addr - 0x1B) as usize
    }

    fn set_common(&mut self, addr: u8, value: u8) {
        self.common[Self::common_index(addr)] = value;
    }

    fn bank(&self) -> usize {
        (self.common[Self::common_index(ECON1.addr)] & 0x03) as usize
    }

    fn reg(&self, addr: u8) -> u8 {
        if addr >= 0x1B {
            self.common[Self::common_index(addr)]
        } else {
            self.banks[self.bank()][addr as usize]
        }
    }

    fn reg_mut(&mut self, addr: u8) -> &mut u8 {
        if addr >= 0x1B {
            &mut self.common[Self::common_index(addr)]
        } else {
            let bank = self.bank();
            &mut self.banks[bank][addr as usize]
        }
    }

    pub fn read(&self, reg: Register) -> u8 {
        match reg.bank.select_bits() {
            Some(bank) => self.banks[bank as usize][reg.addr as usize],
            None => self.common[Self::common_index(reg.addr)],
        }
    }

    pub fn write(&mut self, reg: Register, value: u8) {
        match reg.bank.select_bits() {
            Some(bank) => self.banks[bank as usize][reg.addr as usize] = value,
            None => self.common[Self::common_index(reg.addr)] = value,
        }
    }

    pub fn read16(&self, reg: Register) -> u16 {
        u16::from_le_bytes([self.read(reg), self.read(reg.high())])
    }

    fn write16(&mut self, reg: Register, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.write(reg, low);
        self.write(reg.high(), high);
    }

    pub fn packet_count(&self) -> u8 {
        self.read(EPKTCNT)
    }

    pub fn flags(&self) -> Eir {
        Eir::from_bits_retain(self.read(EIR))
    }

    pub fn set_link(&mut self, up: bool) {
        if self.link != up {
            self.link = up;
            let eir = self.read(EIR) | Eir::LINKIF.bits();
            self.write(EIR, eir);
        }
    }

    fn ring_bounds(&self) -> (u16, u16) {
        (self.read16(ERXST), self.read16(ERXND))
    }

    fn ring_wrap(&self, addr: u16) -> u16 {
        let (start, end) = self.ring_bounds();
        if start <= end && addr > end {
            start + (addr - end - 1)
        } else {
            addr
        }
    }

    fn write_ring(&mut self, addr: u16, data: &[u8]) -> u16 {
        let mut addr = addr;
        for byte in data {
            self.memory[addr as usize] = *byte;
            addr = self.ring_wrap(addr + 1);
        }
        addr
    }

    /// Stores a frame at the hardware write pointer the way the receive
    /// logic does and bumps EPKTCNT.
    pub fn inject_frame(&mut self, frame: &[u8]) {
        self.inject_with_status(frame, RxStatus::RECEIVED_OK.bits());
    }

    pub fn inject_with_status(&mut self, frame: &[u8], status: u16) {
        let write_ptr = self.read16(ERXWRPT);
        let byte_count = frame.len() as u16 + 4;
        let mut next = write_ptr as u32 + 6 + byte_count as u32;
        if next % 2 == 1 {
            next += 1;
        }
        let next = self.ring_wrap(next as u16);

        let mut header = Vec::with_capacity(6);
        header.extend_from_slice(&next.to_le_bytes());
        header.extend_from_slice(&byte_count.to_le_bytes());
        header.extend_from_slice(&status.to_le_bytes());
        let body_start = self.write_ring(write_ptr, &header);
        let crc_start = self.write_ring(body_start, frame);
        self.write_ring(crc_start, &[0xAA; 4]);

        self.push_entry(next);
    }

    /// Writes a raw receive header without a body.
    pub fn inject_header(&mut self, next: u16, byte_count: u16, status: u16) {
        let write_ptr = self.read16(ERXWRPT);
        let mut header = Vec::with_capacity(6);
        header.extend_from_slice(&next.to_le_bytes());
        header.extend_from_slice(&byte_count.to_le_bytes());
        header.extend_from_slice(&status.to_le_bytes());
        self.write_ring(write_ptr, &header);
        let after = self.ring_wrap(write_ptr + 64);
        self.push_entry(after);
    }

    fn push_entry(&mut self, next: u16) {
        self.write16(ERXWRPT, next);
        let count = self.packet_count().saturating_add(1);
        self.write(EPKTCNT, count);
        let eir = self.read(EIR) | Eir::PKTIF.bits();
        self.write(EIR, eir);
    }

    fn read_buffer(&mut self, out: &mut [u8]) {
        let mut ptr = self.read16(ERDPT);
        let (_, end) = self.ring_bounds();
        for slot in out.iter_mut() {
            *slot = self.memory[ptr as usize % BUFFER_SIZE as usize];
            ptr = if ptr == end { self.ring_bounds().0 } else { (ptr + 1) % BUFFER_SIZE };
        }
        self.write16(ERDPT, ptr);
    }

    fn write_buffer(&mut self, data: &[u8]) {
        let mut ptr = self.read16(EWRPT);
        for byte in data {
            self.memory[ptr as usize] = *byte;
            ptr = (ptr + 1) % BUFFER_SIZE;
        }
        self.write16(EWRPT, ptr);
    }

    fn after_write(&mut self, addr: u8) {
        let bank = self.bank();
        if bank == 0 && (addr == ERXST.addr || addr == ERXST.addr + 1) {
            let start = self.read16(ERXST);
            self.write16(ERXWRPT, start);
        }
        if bank == 2 && addr == MICMD.addr && self.reg(addr) & MICMD_MIIRD != 0 {
            let phy_reg = self.read(MIREGADR);
            let value = self.phy_value(phy_reg);
            self.write16(MIRDL, value);
            if phy_reg == PHIR {
                let eir = self.read(EIR) & !Eir::LINKIF.bits();
                self.write(EIR, eir);
            }
        }
        if bank == 2 && addr == MIWRH.addr {
            let reg = self.read(MIREGADR) as usize & 0x1F;
            self.phy[reg] = self.read16(MIWRL);
        }
    }

    fn phy_value(&self, reg: u8) -> u16 {
        match reg {
            PHSTAT2 if self.link => self.phy[PHSTAT2 as usize] | PHSTAT2_LSTAT,
            PHSTAT2 => self.phy[PHSTAT2 as usize] & !PHSTAT2_LSTAT,
            _ => self.phy[reg as usize & 0x1F],
        }
    }

    fn after_bit_set(&mut self, addr: u8, mask: u8) {
        if addr == ECON1.addr && mask & Econ1::TXRTS.bits() != 0 {
            self.transmit();
        }
        if addr == ECON2.addr && mask & Econ2::PKTDEC.bits() != 0 {
            let count = self.packet_count().saturating_sub(1);
            self.write(EPKTCNT, count);
            let econ2 = self.read(ECON2) & !Econ2::PKTDEC.bits();
            self.write(ECON2, econ2);
        }
    }

    fn transmit(&mut self) {
        if self.tx_stuck {
            return;
        }
        let econ1 = self.read(ECON1) & !Econ1::TXRTS.bits();
        self.write(ECON1, econ1);
        if self.fail_next_tx {
            self.fail_next_tx = false;
            let eir = self.read(EIR) | Eir::TXERIF.bits();
            self.write(EIR, eir);
            return;
        }
        let start = self.read16(ETXST) as usize + 1;
        let end = self.read16(ETXND) as usize;
        self.sent.push(self.memory[start..=end].to_vec());
        let eir = self.read(EIR) | Eir::TXIF.bits();
        self.write(EIR, eir);
    }

    fn soft_reset(&mut self) {
        self.resets += 1;
        self.power_on();
    }

    fn execute(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        if self.bus_error {
            return Err(NetError::HardwareFault);
        }
        let command = *write.first().ok_or(NetError::HardwareFault)?;
        match command {
            OP_SOFT_RESET => self.soft_reset(),
            OP_READ_BUF => self.read_buffer(read),
            OP_WRITE_BUF => self.write_buffer(&write[1..]),
            _ => {
                let addr = command & ADDR_MASK;
                let data = write.get(1).copied().unwrap_or(0);
                match command & 0xE0 {
                    OP_READ_CTRL => {
                        let value = self.reg(addr);
                        if let Some(last) = read.last_mut() {
                            *last = value;
                        }
                    }
                    OP_WRITE_CTRL => {
                        *self.reg_mut(addr) = data;
                        self.after_write(addr);
                    }
                    OP_BIT_SET => {
                        *self.reg_mut(addr) |= data;
                        self.after_bit_set(addr, data);
                    }
                    OP_BIT_CLEAR => *self.reg_mut(addr) &= !data,
                    _ => return Err(NetError::HardwareFault),
                }
            }
        }
        Ok(())
    }
}

/// SPI handle sharing one chip model with the test body.
#[derive(Clone)]
pub struct MockSpi(pub Arc<Mutex<ChipModel>>);

impl MockSpi {
    pub fn new() -> Self {
        MockSpi(Arc::new(Mutex::new(ChipModel::new())))
    }

    pub fn chip(&self) -> spin::MutexGuard<'_, ChipModel> {
        self.0.lock()
    }
}

impl SpiDevice for MockSpi {
    fn transaction(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        self.0.lock().execute(write, read)
    }
}
