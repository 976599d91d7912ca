// ENC28J60 SPI opcodes, control registers and bit definitions
use bitflags::bitflags;

// SPI instruction set
pub const OP_READ_CTRL: u8 = 0x00;
pub const OP_READ_BUF: u8 = 0x3A;
pub const OP_WRITE_CTRL: u8 = 0x40;
pub const OP_WRITE_BUF: u8 = 0x7A;
pub const OP_BIT_SET: u8 = 0x80;
pub const OP_BIT_CLEAR: u8 = 0xA0;
pub const OP_SOFT_RESET: u8 = 0xFF;

pub const ADDR_MASK: u8 = 0x1F;

/// Register banks selected through ECON1.BSEL. Addresses 0x1B..=0x1F are
/// mapped in every bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Common,
    B0,
    B1,
    B2,
    B3,
}

impl Bank {
    pub fn select_bits(self) -> Option<u8> {
        match self {
            Bank::Common => None,
            Bank::B0 => Some(0),
            Bank::B1 => Some(1),
            Bank::B2 => Some(2),
            Bank::B3 => Some(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub bank: Bank,
    pub addr: u8,
    /// MAC and MII registers shift out a dummy byte before the data
    pub mac_mii: bool,
}

impl Register {
    const fn eth(bank: Bank, addr: u8) -> Self {
        Register { bank, addr, mac_mii: false }
    }

    const fn mac(bank: Bank, addr: u8) -> Self {
        Register { bank, addr, mac_mii: true }
    }

    /// High byte of a 16-bit register pair.
    pub const fn high(self) -> Self {
        Register { addr: self.addr + 1, ..self }
    }
}

// Common registers
pub const EIE: Register = Register::eth(Bank::Common, 0x1B);
pub const EIR: Register = Register::eth(Bank::Common, 0x1C);
pub const ESTAT: Register = Register::eth(Bank::Common, 0x1D);
pub const ECON2: Register = Register::eth(Bank::Common, 0x1E);
pub const ECON1: Register = Register::eth(Bank::Common, 0x1F);

// Bank 0, low byte of each pointer pair
pub const ERDPT: Register = Register::eth(Bank::B0, 0x00);
pub const EWRPT: Register = Register::eth(Bank::B0, 0x02);
pub const ETXST: Register = Register::eth(Bank::B0, 0x04);
pub const ETXND: Register = Register::eth(Bank::B0, 0x06);
pub const ERXST: Register = Register::eth(Bank::B0, 0x08);
pub const ERXND: Register = Register::eth(Bank::B0, 0x0A);
pub const ERXRDPT: Register = Register::eth(Bank::B0, 0x0C);
pub const ERXWRPT: Register = Register::eth(Bank::B0, 0x0E);
pub const EPMO: Register = Register::eth(Bank::B0, 0x14);

// Bank 1
pub const EPMM0: Register = Register::eth(Bank::B1, 0x08);
pub const EPMM1: Register = Register::eth(Bank::B1, 0x09);
pub const EPMCS: Register = Register::eth(Bank::B1, 0x10);
pub const ERXFCON: Register = Register::eth(Bank::B1, 0x18);
pub const EPKTCNT: Register = Register::eth(Bank::B1, 0x19);

// Bank 2
pub const MACON1: Register = Register::mac(Bank::B2, 0x00);
pub const MACON3: Register = Register::mac(Bank::B2, 0x02);
pub const MACON4: Register = Register::mac(Bank::B2, 0x03);
pub const MABBIPG: Register = Register::mac(Bank::B2, 0x04);
pub const MAIPGL: Register = Register::mac(Bank::B2, 0x06);
pub const MAIPGH: Register = Register::mac(Bank::B2, 0x07);
pub const MAMXFL: Register = Register::mac(Bank::B2, 0x0A);
pub const MICMD: Register = Register::mac(Bank::B2, 0x12);
pub const MIREGADR: Register = Register::mac(Bank::B2, 0x14);
pub const MIWRL: Register = Register::mac(Bank::B2, 0x16);
pub const MIWRH: Register = Register::mac(Bank::B2, 0x17);
pub const MIRDL: Register = Register::mac(Bank::B2, 0x18);
pub const MIRDH: Register = Register::mac(Bank::B2, 0x19);

// Bank 3
pub const MAADR5: Register = Register::mac(Bank::B3, 0x00);
pub const MAADR6: Register = Register::mac(Bank::B3, 0x01);
pub const MAADR3: Register = Register::mac(Bank::B3, 0x02);
pub const MAADR4: Register = Register::mac(Bank::B3, 0x03);
pub const MAADR1: Register = Register::mac(Bank::B3, 0x04);
pub const MAADR2: Register = Register::mac(Bank::B3, 0x05);
pub const MISTAT: Register = Register::mac(Bank::B3, 0x0A);
pub const EREVID: Register = Register::eth(Bank::B3, 0x12);

/// MAADR registers in MAC byte order.
pub const MAC_ADDRESS_REGS: [Register; 6] = [MAADR1, MAADR2, MAADR3, MAADR4, MAADR5, MAADR6];

// PHY registers, reached through MIREGADR
pub const PHCON1: u8 = 0x00;
pub const PHSTAT1: u8 = 0x01;
pub const PHCON2: u8 = 0x10;
pub const PHSTAT2: u8 = 0x11;
pub const PHIE: u8 = 0x12;
pub const PHIR: u8 = 0x13;
pub const PHLCON: u8 = 0x14;

pub const PHSTAT2_LSTAT: u16 = 0x0400;
pub const PHCON1_PDPXMD: u16 = 0x0100;
pub const PHCON2_HDLDIS: u16 = 0x0100;
pub const PHIE_PGEIE: u16 = 0x0002;
pub const PHIE_PLNKIE: u16 = 0x0010;
/// LEDA link/activity, LEDB receive activity, stretched pulses
pub const PHLCON_LEDS: u16 = 0x3472;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eie: u8 {
        const INTIE = 0x80;
        const PKTIE = 0x40;
        const DMAIE = 0x20;
        const LINKIE = 0x10;
        const TXIE = 0x08;
        const TXERIE = 0x02;
        const RXERIE = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eir: u8 {
        const PKTIF = 0x40;
        const DMAIF = 0x20;
        const LINKIF = 0x10;
        const TXIF = 0x08;
        const TXERIF = 0x02;
        const RXERIF = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Estat: u8 {
        const INT = 0x80;
        const LATECOL = 0x10;
        const RXBUSY = 0x04;
        const TXABRT = 0x02;
        const CLKRDY = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Econ1: u8 {
        const TXRST = 0x80;
        const RXRST = 0x40;
        const DMAST = 0x20;
        const CSUMEN = 0x10;
        const TXRTS = 0x08;
        const RXEN = 0x04;
        const BSEL1 = 0x02;
        const BSEL0 = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Econ2: u8 {
        const AUTOINC = 0x80;
        const PKTDEC = 0x40;
        const PWRSV = 0x20;
        const VRPS = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Erxfcon: u8 {
        const UCEN = 0x80;
        const ANDOR = 0x40;
        const CRCEN = 0x20;
        const PMEN = 0x10;
        const MPEN = 0x08;
        const HTEN = 0x04;
        const MCEN = 0x02;
        const BCEN = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Macon1: u8 {
        const TXPAUS = 0x08;
        const RXPAUS = 0x04;
        const PASSALL = 0x02;
        const MARXEN = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Macon3: u8 {
        const PADCFG0 = 0x20;
        const TXCRCEN = 0x10;
        const PHDREN = 0x08;
        const HFRMEN = 0x04;
        const FRMLNEN = 0x02;
        const FULDPX = 0x01;
    }
}

bitflags! {
    /// Low 16 bits of the receive status vector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxStatus: u16 {
        const ZERO = 0x8000;
        const VLAN = 0x4000;
        const UNKNOWN_OPCODE = 0x2000;
        const PAUSE = 0x1000;
        const CONTROL = 0x0800;
        const DRIBBLE = 0x0400;
        const BROADCAST = 0x0200;
        const MULTICAST = 0x0100;
        const RECEIVED_OK = 0x0080;
        const LENGTH_OUT_OF_RANGE = 0x0040;
        const LENGTH_CHECK_ERROR = 0x0020;
        const CRC_ERROR = 0x0010;
        const CARRIER_EVENT = 0x0004;
        const LONG_EVENT = 0x0001;
    }
}

pub const MICMD_MIIRD: u8 = 0x01;
pub const MISTAT_BUSY: u8 = 0x01;

// Buffer memory layout: RX ring first (errata: RX must start at 0), TX after
pub const BUFFER_SIZE: u16 = 0x2000;
pub const RXSTART: u16 = 0x0000;
pub const RXSTOP: u16 = 0x19FF;
pub const TXSTART: u16 = 0x1A00;
pub const TXSTOP: u16 = 0x1FFF;

pub const MAX_FRAME_LEN: u16 = 1518;
pub const MIN_FRAME_LEN: u16 = 14;
pub const RX_HEADER_LEN: usize = 6;

/// Pattern match for ARP broadcasts: destination ff:ff:ff:ff:ff:ff and
/// EtherType 0x0806 (bytes 0..6 and 12..14 of the frame).
pub const ARP_PATTERN_MASK: [u8; 2] = [0x3F, 0x30];
pub const ARP_PATTERN_CHECKSUM: u16 = 0xF7F9;

/// Back-to-back inter-packet gap for full duplex.
pub const MABBIPG_FULL_DUPLEX: u8 = 0x15;
pub const MAIPGL_DEFAULT: u8 = 0x12;

/// Silicon revisions report 1..=6; an unresponsive bus reads 0x00 or 0xFF.
pub fn revision_valid(revision: u8) -> bool {
    revision != 0x00 && revision != 0xFF
}
