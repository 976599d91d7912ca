#![cfg(test)]

use super::mock::MockSpi;
use super::*;
use crate::hal::testing::ManualClock;

const MAC: MacAddress = MacAddress::new([0x02, 0x04, 0xa3, 0x28, 0x60, 0x01]);

fn started() -> (Enc28j60<MockSpi>, MockSpi) {
    let spi = MockSpi::new();
    let mut driver = Enc28j60::new(spi.clone());
    driver.init(MAC, &ManualClock::new(0)).unwrap();
    (driver, spi)
}

fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

#[test]
fn test_init_programs_buffers_and_mac() {
    let (driver, spi) = started();
    let chip = spi.chip();
    assert_eq!(driver.revision(), 6);
    assert_eq!(chip.resets, 1);
    assert_eq!(chip.read16(ERXST), RXSTART);
    assert_eq!(chip.read16(ERXND), RXSTOP);
    assert_eq!(chip.read16(ERXRDPT), RXSTOP);
    assert_eq!(chip.read16(ETXST), TXSTART);
    assert_eq!(chip.read(MAADR1), 0x02);
    assert_eq!(chip.read(MAADR6), 0x01);
    assert_eq!(chip.read(EIE), ENABLED_INTERRUPTS.bits());
    assert_eq!(chip.read(ERXFCON), FilterLevel::Open.erxfcon().bits());
    assert!(Econ1::from_bits_retain(chip.read(ECON1)).contains(Econ1::RXEN));
    assert_eq!(chip.phy[PHCON2 as usize], PHCON2_HDLDIS);
    assert_eq!(chip.read16(MAMXFL), MAX_FRAME_LEN);
}

#[test]
fn test_init_rejects_dead_chip() {
    let spi = MockSpi::new();
    spi.chip().revision = 0xFF;
    let mut driver = Enc28j60::new(spi.clone());
    assert_eq!(
        driver.init(MAC, &ManualClock::new(0)),
        Err(NetError::ChipNotResponding)
    );

    let spi = MockSpi::new();
    spi.chip().bus_error = true;
    let mut driver = Enc28j60::new(spi);
    assert_eq!(driver.init(MAC, &ManualClock::new(0)), Err(NetError::HardwareFault));
}

#[test]
fn test_transmit_writes_tx_window() {
    let (mut driver, spi) = started();
    let out = frame(60, 3);
    assert_eq!(driver.transmit(&out), Ok(true));
    assert_eq!(spi.chip().sent, [out.clone()]);
    assert_eq!(spi.chip().read16(ETXND), TXSTART + 60);

    assert!(driver.transmit(&[]).is_err());
    assert!(driver.transmit(&frame(1600, 0)).is_err());
}

#[test]
fn test_transmit_error_resets_tx_logic() {
    let (mut driver, spi) = started();
    spi.chip().fail_next_tx = true;
    assert_eq!(driver.transmit(&frame(60, 0)), Ok(false));
    assert!(!spi.chip().flags().contains(Eir::TXERIF));
    assert!(spi.chip().sent.is_empty());

    spi.chip().tx_stuck = true;
    assert_eq!(driver.transmit(&frame(60, 0)), Ok(false));
    let econ1 = Econ1::from_bits_retain(spi.chip().read(ECON1));
    assert!(!econ1.contains(Econ1::TXRTS));

    spi.chip().tx_stuck = false;
    assert_eq!(driver.transmit(&frame(60, 0)), Ok(true));
}

#[test]
fn test_receive_frames_in_order() {
    let (mut driver, spi) = started();
    let first = frame(64, 1);
    let second = frame(99, 2);
    spi.chip().inject_frame(&first);
    spi.chip().inject_frame(&second);
    assert_eq!(driver.packet_count(), Ok(2));

    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(first)));
    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(second)));
    assert_eq!(driver.receive(), Ok(RxOutcome::Empty));
    assert_eq!(driver.packet_count(), Ok(0));

    let chip = spi.chip();
    assert_eq!(driver.ring().next(), chip.read16(ERXWRPT));
    assert_eq!(chip.read16(ERXRDPT), driver.ring().next() - 1);
}

#[test]
fn test_receive_across_ring_wrap() {
    let (mut driver, spi) = started();
    for seed in 0..8u8 {
        let expected = frame(1000, seed);
        spi.chip().inject_frame(&expected);
        assert_eq!(driver.receive(), Ok(RxOutcome::Frame(expected)));
    }
    // Seventh entry crossed ERXND
    assert!(driver.ring().next() < 0x1000);
    assert_eq!(driver.packet_count(), Ok(0));
}

#[test]
fn test_bad_status_is_dropped() {
    let (mut driver, spi) = started();
    let status = (RxStatus::RECEIVED_OK | RxStatus::CRC_ERROR).bits();
    spi.chip().inject_with_status(&frame(64, 0), status);
    let good = frame(64, 9);
    spi.chip().inject_frame(&good);

    assert!(matches!(driver.receive(), Ok(RxOutcome::Dropped(s)) if s.contains(RxStatus::CRC_ERROR)));
    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(good)));
}

#[test]
fn test_corrupt_header_resyncs_ring() {
    let (mut driver, spi) = started();
    spi.chip().inject_header(0x0101, 64, RxStatus::RECEIVED_OK.bits());
    spi.chip().inject_frame(&frame(64, 0));
    assert_eq!(driver.packet_count(), Ok(2));

    assert_eq!(driver.receive(), Ok(RxOutcome::Resync));
    assert_eq!(driver.packet_count(), Ok(0));
    assert_eq!(driver.ring().next(), spi.chip().read16(ERXWRPT));

    let after = frame(80, 4);
    spi.chip().inject_frame(&after);
    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(after)));
}

#[test]
fn test_next_pointer_must_match_entry_length() {
    let (mut driver, spi) = started();
    // Even and inside the ring, but not where a 64 byte entry ends
    spi.chip().inject_header(0x0200, 64, RxStatus::RECEIVED_OK.bits());
    assert_eq!(driver.receive(), Ok(RxOutcome::Resync));
    assert_eq!(driver.packet_count(), Ok(0));

    // Odd length entries end on the next even address
    let odd = frame(61, 3);
    spi.chip().inject_frame(&odd);
    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(odd)));
    assert_eq!(driver.ring().next() % 2, 0);
}

#[test]
fn test_oversize_and_zero_bit_resync() {
    let (mut driver, spi) = started();
    spi.chip().inject_header(0x0100, 4000, RxStatus::RECEIVED_OK.bits());
    assert_eq!(driver.receive(), Ok(RxOutcome::Resync));

    let status = (RxStatus::RECEIVED_OK | RxStatus::ZERO).bits();
    spi.chip().inject_with_status(&frame(64, 0), status);
    assert_eq!(driver.receive(), Ok(RxOutcome::Resync));
}

#[test]
fn test_link_state_from_phy() {
    let (mut driver, spi) = started();
    assert_eq!(driver.link_up(), Ok(true));
    spi.chip().set_link(false);
    assert_eq!(driver.link_up(), Ok(false));
    assert!(driver.interrupt_flags().unwrap().contains(Eir::LINKIF));
    driver.clear_flags(Eir::LINKIF).unwrap();
    assert!(!spi.chip().flags().contains(Eir::LINKIF));
}

#[test]
fn test_filter_levels() {
    let (mut driver, spi) = started();
    driver.set_filter(FilterLevel::BroadcastLimited).unwrap();
    assert_eq!(
        spi.chip().read(ERXFCON),
        (Erxfcon::UCEN | Erxfcon::CRCEN | Erxfcon::PMEN).bits()
    );
    assert_eq!(spi.chip().read16(EPMCS), ARP_PATTERN_CHECKSUM);

    driver.set_filter(FilterLevel::UnicastOnly).unwrap();
    assert_eq!(driver.filter(), FilterLevel::UnicastOnly);
    assert_eq!(spi.chip().read(ERXFCON), (Erxfcon::UCEN | Erxfcon::CRCEN).bits());
}

#[test]
fn test_repair_registers_restores_drift() {
    let (mut driver, spi) = started();
    assert_eq!(driver.repair_registers(), Ok(false));

    {
        let mut chip = spi.chip();
        chip.write(EIE, Eie::PKTIE.bits());
        let econ1 = chip.read(ECON1) & !Econ1::RXEN.bits();
        chip.write(ECON1, econ1);
    }
    assert_eq!(driver.repair_registers(), Ok(true));
    assert_eq!(spi.chip().read(EIE), ENABLED_INTERRUPTS.bits());
    assert!(Econ1::from_bits_retain(spi.chip().read(ECON1)).contains(Econ1::RXEN));
    assert_eq!(driver.repair_registers(), Ok(false));
}

#[test]
fn test_reset_receiver_empties_ring() {
    let (mut driver, spi) = started();
    spi.chip().inject_frame(&frame(64, 0));
    driver.receive().unwrap();
    spi.chip().inject_frame(&frame(64, 1));
    spi.chip().inject_frame(&frame(64, 2));

    driver.reset_receiver().unwrap();
    assert_eq!(driver.packet_count(), Ok(0));
    assert_eq!(driver.ring().next(), RXSTART);
    assert_eq!(spi.chip().read16(ERXWRPT), RXSTART);
    assert!(Econ1::from_bits_retain(spi.chip().read(ECON1)).contains(Econ1::RXEN));

    let fresh = frame(70, 7);
    spi.chip().inject_frame(&fresh);
    assert_eq!(driver.receive(), Ok(RxOutcome::Frame(fresh)));
}

#[test]
fn test_bank_cache_resync() {
    let (mut driver, spi) = started();
    {
        let mut chip = spi.chip();
        let econ1 = chip.read(ECON1) | 0x03;
        chip.write(ECON1, econ1);
    }
    driver.sync_bank().unwrap();
    assert_eq!(driver.packet_count(), Ok(0));
    assert_eq!(driver.read_reg(EREVID), Ok(6));
}
