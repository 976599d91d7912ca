//! Link controller: interrupt service, receive filter policy and recovery
//! on top of the [`Enc28j60`] register driver.

use crate::config::StackConfig;
use crate::enc28j60::regs::Eir;
use crate::enc28j60::{Enc28j60, FilterLevel, RxOutcome};
use crate::error::{NetError, Result};
use crate::hal::{Clock, InterruptLine, OutputPin, SpiDevice};
use crate::net::ethernet::{EthernetController, Maintenance, MacAddress, ResetKind, ServiceReport};
use crate::timer::SoftTimer;

/// Frames drained per service pass before yielding.
const MAX_DRAIN: usize = 32;
const RESET_PULSE_MS: u32 = 1;
const RESET_SETTLE_MS: u32 = 2;

// Backlog thresholds for narrowing the receive filter
const BACKLOG_UNICAST_ONLY: u8 = 8;
const BACKLOG_BROADCAST_LIMITED: u8 = 4;
const CALM_BACKLOG: u8 = 1;
/// Consecutive calm passes before the filter widens one step.
const CALM_PASSES_TO_WIDEN: u32 = 16;

/// Chooses the filter level from the receive backlog seen on each pass.
///
/// Narrowing is immediate; widening goes one level at a time after a run
/// of calm passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPolicy {
    level: FilterLevel,
    calm_passes: u32,
}

impl FilterPolicy {
    pub const fn new() -> Self {
        FilterPolicy {
            level: FilterLevel::Open,
            calm_passes: 0,
        }
    }

    pub fn level(&self) -> FilterLevel {
        self.level
    }

    pub fn observe(&mut self, backlog: u8) -> FilterLevel {
        let wanted = if backlog >= BACKLOG_UNICAST_ONLY {
            FilterLevel::UnicastOnly
        } else if backlog >= BACKLOG_BROADCAST_LIMITED {
            FilterLevel::BroadcastLimited
        } else {
            FilterLevel::Open
        };

        if wanted > self.level {
            self.level = wanted;
            self.calm_passes = 0;
        } else if backlog <= CALM_BACKLOG {
            self.calm_passes += 1;
            if self.calm_passes >= CALM_PASSES_TO_WIDEN {
                self.level = match self.level {
                    FilterLevel::UnicastOnly => FilterLevel::BroadcastLimited,
                    _ => FilterLevel::Open,
                };
                self.calm_passes = 0;
            }
        } else {
            self.calm_passes = 0;
        }
        self.level
    }
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LinkController<S: SpiDevice, P: OutputPin, I: InterruptLine> {
    chip: Enc28j60<S>,
    reset_pin: P,
    irq: I,
    policy: FilterPolicy,
    started: bool,
    link: bool,
    link_since: Option<u64>,
    last_rx: u64,
    last_rx_reset: Option<u64>,
    watchdog_stall_ms: u64,
    rx_reset_interval_ms: u64,
    repair_interval_ms: u64,
    repair_timer: SoftTimer,
}

impl<S: SpiDevice, P: OutputPin, I: InterruptLine> LinkController<S, P, I> {
    pub fn new(spi: S, reset_pin: P, irq: I, config: &StackConfig) -> Self {
        LinkController {
            chip: Enc28j60::new(spi),
            reset_pin,
            irq,
            policy: FilterPolicy::new(),
            started: false,
            link: false,
            link_since: None,
            last_rx: 0,
            last_rx_reset: None,
            watchdog_stall_ms: config.watchdog_stall_ms,
            rx_reset_interval_ms: config.rx_reset_interval_ms,
            repair_interval_ms: config.register_repair_interval_ms,
            repair_timer: SoftTimer::new(),
        }
    }

    pub fn chip(&mut self) -> &mut Enc28j60<S> {
        &mut self.chip
    }

    pub fn filter_policy(&self) -> &FilterPolicy {
        &self.policy
    }

    fn bring_up(&mut self, mac: MacAddress, clock: &dyn Clock) -> Result<()> {
        self.irq.disable();
        self.started = false;
        self.chip.init(mac, clock)?;

        let now = clock.now_ms();
        self.policy = FilterPolicy::new();
        self.link = self.chip.link_up()?;
        self.link_since = if self.link { Some(now) } else { None };
        self.last_rx = now;
        self.repair_timer = SoftTimer::periodic(self.repair_interval_ms, now);
        self.started = true;

        self.irq.clear();
        self.irq.enable();
        log::info!("enc28j60: started, link {}", if self.link { "up" } else { "down" });
        Ok(())
    }

    fn update_link(&mut self, up: bool, now: u64) -> Option<bool> {
        if up == self.link {
            return None;
        }
        self.link = up;
        self.link_since = if up { Some(now) } else { None };
        log::info!("enc28j60: link {}", if up { "up" } else { "down" });
        Some(up)
    }

    fn service_pass(&mut self, now: u64) -> Result<ServiceReport> {
        let mut report = ServiceReport::default();
        let flags = self.chip.interrupt_flags()?;
        let backlog = self.chip.packet_count()?;

        let pending = Eir::PKTIF | Eir::LINKIF | Eir::TXERIF | Eir::RXERIF;
        if !flags.intersects(pending) && backlog == 0 {
            // Spurious wakeup: assume the cached bank went stale
            self.chip.sync_bank()?;
            return Ok(report);
        }

        if flags.intersects(Eir::TXERIF | Eir::RXERIF) {
            if flags.contains(Eir::RXERIF) {
                log::debug!("enc28j60: receive buffer overflow");
            }
            self.chip.clear_flags(Eir::TXERIF | Eir::RXERIF)?;
        }

        if flags.contains(Eir::LINKIF) {
            self.chip.clear_link_interrupt()?;
            let up = self.chip.link_up()?;
            report.link_changed = self.update_link(up, now);
        }

        let level = self.policy.observe(backlog);
        if level != self.chip.filter() {
            self.chip.set_filter(level)?;
        }

        for _ in 0..MAX_DRAIN {
            match self.chip.receive()? {
                RxOutcome::Frame(frame) => {
                    self.last_rx = now;
                    report.frames.push(frame);
                }
                RxOutcome::Dropped(_) => report.dropped += 1,
                RxOutcome::Resync => {
                    report.dropped += 1;
                    break;
                }
                RxOutcome::Empty => break,
            }
        }
        self.chip.clear_flags(Eir::PKTIF)?;
        Ok(report)
    }
}

impl<S, P, I> EthernetController for LinkController<S, P, I>
where
    S: SpiDevice + Send,
    P: OutputPin + Send,
    I: InterruptLine + Send,
{
    fn mac_address(&self) -> MacAddress {
        self.chip.mac_address()
    }

    fn start(&mut self, mac: MacAddress, clock: &dyn Clock) -> Result<()> {
        self.bring_up(mac, clock)
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !self.started {
            return Err(NetError::NotStarted);
        }
        if !self.chip.transmit(frame)? {
            log::debug!("enc28j60: frame of {} bytes not sent", frame.len());
        }
        Ok(())
    }

    fn service(&mut self, now_ms: u64) -> Result<ServiceReport> {
        if !self.started {
            return Ok(ServiceReport::default());
        }
        self.irq.clear();
        self.chip.disable_interrupts()?;
        let report = self.service_pass(now_ms);
        self.chip.enable_interrupts()?;
        report
    }

    fn link_up(&mut self) -> bool {
        self.started && self.chip.link_up().unwrap_or(false)
    }

    fn maintain(&mut self, now_ms: u64) -> Maintenance {
        let mut maintenance = Maintenance::default();
        if !self.started {
            return maintenance;
        }

        match self.chip.link_up() {
            Ok(up) => maintenance.link_changed = self.update_link(up, now_ms),
            Err(err) => log::warn!("enc28j60: link check failed: {}", err),
        }

        let stable = self
            .link_since
            .map_or(false, |since| now_ms.saturating_sub(since) >= self.watchdog_stall_ms);
        if stable && now_ms.saturating_sub(self.last_rx) >= self.watchdog_stall_ms {
            log::warn!(
                "enc28j60: no frames for {} ms, re-arming interrupt",
                now_ms.saturating_sub(self.last_rx)
            );
            self.irq.clear();
            self.last_rx = now_ms;
            maintenance.force_service = true;
        }

        if self.repair_timer.poll(now_ms) {
            match self.chip.repair_registers() {
                Ok(true) => log::warn!("enc28j60: control registers repaired"),
                Ok(false) => {}
                Err(err) => log::warn!("enc28j60: register check failed: {}", err),
            }
        }
        maintenance
    }

    fn reset_receiver(&mut self, now_ms: u64) -> bool {
        if !self.started {
            return false;
        }
        if let Some(last) = self.last_rx_reset {
            if now_ms.saturating_sub(last) < self.rx_reset_interval_ms {
                return false;
            }
        }
        self.last_rx_reset = Some(now_ms);
        match self.chip.reset_receiver() {
            Ok(()) => {
                log::warn!("enc28j60: receive logic reset");
                self.policy = FilterPolicy::new();
                true
            }
            Err(err) => {
                log::error!("enc28j60: receive reset failed: {}", err);
                false
            }
        }
    }

    fn reset(&mut self, kind: ResetKind, clock: &dyn Clock) -> Result<()> {
        let mac = self.chip.mac_address();
        if mac.is_zero() {
            return Err(NetError::NotStarted);
        }
        log::warn!("enc28j60: {:?} reset", kind);
        if kind == ResetKind::Hard {
            self.reset_pin.set_low();
            clock.delay_ms(RESET_PULSE_MS);
            self.reset_pin.set_high();
            clock.delay_ms(RESET_SETTLE_MS);
        }
        self.bring_up(mac, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc28j60::mock::MockSpi;
    use crate::enc28j60::regs::{Eie, Erxfcon, EIE, ERXFCON};
    use crate::hal::testing::ManualClock;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    const MAC: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x10]);

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicU32>);

    impl Counter {
        fn get(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }

        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PulsePin(Counter);

    impl OutputPin for PulsePin {
        fn set_high(&mut self) {}
        fn set_low(&mut self) {
            self.0.bump();
        }
    }

    struct Irq {
        clears: Counter,
        enables: Counter,
    }

    impl InterruptLine for Irq {
        fn enable(&mut self) {
            self.enables.bump();
        }
        fn disable(&mut self) {}
        fn clear(&mut self) {
            self.clears.bump();
        }
    }

    struct Rig {
        link: LinkController<MockSpi, PulsePin, Irq>,
        spi: MockSpi,
        clock: ManualClock,
        pulses: Counter,
        clears: Counter,
        enables: Counter,
    }

    fn rig() -> Rig {
        let spi = MockSpi::new();
        let pulses = Counter::default();
        let clears = Counter::default();
        let enables = Counter::default();
        let irq = Irq { clears: clears.clone(), enables: enables.clone() };
        let mut link = LinkController::new(spi.clone(), PulsePin(pulses.clone()), irq, &StackConfig::default());
        let clock = ManualClock::new(0);
        link.start(MAC, &clock).unwrap();
        Rig { link, spi, clock, pulses, clears, enables }
    }

    fn frame(seed: u8) -> Vec<u8> {
        (0..64).map(|i: u8| i.wrapping_add(seed)).collect()
    }

    #[test]
    fn test_start_and_send() {
        let mut rig = rig();
        assert_eq!(rig.enables.get(), 1);
        assert_eq!(rig.link.mac_address(), MAC);
        assert!(rig.link.link_up());

        rig.link.send_frame(&frame(0)).unwrap();
        assert_eq!(rig.spi.chip().sent.len(), 1);

        let irq = Irq { clears: Counter::default(), enables: Counter::default() };
        let mut idle = LinkController::new(
            MockSpi::new(),
            PulsePin(Counter::default()),
            irq,
            &StackConfig::default(),
        );
        assert_eq!(idle.send_frame(&frame(0)), Err(NetError::NotStarted));
    }

    #[test]
    fn test_service_drains_ring() {
        let mut rig = rig();
        rig.spi.chip().inject_frame(&frame(1));
        rig.spi.chip().inject_with_status(&frame(2), 0);
        rig.spi.chip().inject_frame(&frame(3));

        let report = rig.link.service(10).unwrap();
        assert_eq!(report.frames, [frame(1), frame(3)]);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.link_changed, None);
        assert_eq!(rig.spi.chip().packet_count(), 0);
        assert!(!rig.spi.chip().flags().contains(Eir::PKTIF));
        // INTIE restored after the pass
        assert!(Eie::from_bits_retain(rig.spi.chip().read(EIE)).contains(Eie::INTIE));
    }

    #[test]
    fn test_spurious_service_is_empty() {
        let mut rig = rig();
        let report = rig.link.service(10).unwrap();
        assert!(report.frames.is_empty());
        assert_eq!(report.dropped, 0);
        assert!(rig.clears.get() >= 2);
    }

    #[test]
    fn test_link_edge_reported_once() {
        let mut rig = rig();
        rig.spi.chip().set_link(false);
        assert_eq!(rig.link.service(10).unwrap().link_changed, Some(false));
        assert_eq!(rig.link.service(20).unwrap().link_changed, None);

        rig.spi.chip().set_link(true);
        assert_eq!(rig.link.maintain(30).link_changed, Some(true));
    }

    #[test]
    fn test_filter_policy_narrows_and_widens() {
        let mut policy = FilterPolicy::new();
        assert_eq!(policy.observe(2), FilterLevel::Open);
        assert_eq!(policy.observe(5), FilterLevel::BroadcastLimited);
        assert_eq!(policy.observe(9), FilterLevel::UnicastOnly);
        // Moderate load does not widen
        assert_eq!(policy.observe(3), FilterLevel::UnicastOnly);

        for _ in 0..CALM_PASSES_TO_WIDEN - 1 {
            assert_eq!(policy.observe(0), FilterLevel::UnicastOnly);
        }
        assert_eq!(policy.observe(0), FilterLevel::BroadcastLimited);
        for _ in 0..CALM_PASSES_TO_WIDEN {
            policy.observe(1);
        }
        assert_eq!(policy.level(), FilterLevel::Open);
    }

    #[test]
    fn test_backlog_narrows_hardware_filter() {
        let mut rig = rig();
        for seed in 0..8 {
            rig.spi.chip().inject_frame(&frame(seed));
        }
        let report = rig.link.service(10).unwrap();
        assert_eq!(report.frames.len(), 8);
        assert_eq!(rig.spi.chip().read(ERXFCON), (Erxfcon::UCEN | Erxfcon::CRCEN).bits());
    }

    #[test]
    fn test_watchdog_forces_service() {
        let mut rig = rig();
        assert!(!rig.link.maintain(11_000).force_service);
        let clears = rig.clears.get();
        assert!(rig.link.maintain(12_500).force_service);
        assert_eq!(rig.clears.get(), clears + 1);
        assert!(!rig.link.maintain(13_000).force_service);

        rig.spi.chip().inject_frame(&frame(0));
        rig.link.service(20_000).unwrap();
        assert!(!rig.link.maintain(30_000).force_service);
        assert!(rig.link.maintain(32_000).force_service);
    }

    #[test]
    fn test_watchdog_waits_for_stable_link() {
        let mut rig = rig();
        rig.spi.chip().set_link(false);
        rig.link.maintain(1_000);
        rig.spi.chip().set_link(true);
        rig.link.maintain(2_000);
        assert!(!rig.link.maintain(13_000).force_service);
        assert!(rig.link.maintain(14_000).force_service);
    }

    #[test]
    fn test_receiver_reset_rate_limited() {
        let mut rig = rig();
        assert!(rig.link.reset_receiver(1_000));
        assert!(!rig.link.reset_receiver(3_000));
        assert!(!rig.link.reset_receiver(5_999));
        assert!(rig.link.reset_receiver(6_000));
    }

    #[test]
    fn test_register_repair_on_interval() {
        let mut rig = rig();
        // init burns clock time on reset and PHY delays
        let started = rig.clock.now_ms();
        rig.spi.chip().write(EIE, 0);
        rig.link.maintain(started + 4_000);
        assert_eq!(rig.spi.chip().read(EIE), 0);
        rig.link.maintain(started + 5_000);
        assert_eq!(rig.spi.chip().read(EIE), crate::enc28j60::ENABLED_INTERRUPTS.bits());
    }

    #[test]
    fn test_hard_reset_pulses_pin() {
        let mut rig = rig();
        rig.link.reset(ResetKind::Soft, &rig.clock).unwrap();
        assert_eq!(rig.pulses.get(), 0);
        assert_eq!(rig.spi.chip().resets, 2);

        rig.link.reset(ResetKind::Hard, &rig.clock).unwrap();
        assert_eq!(rig.pulses.get(), 1);
        assert_eq!(rig.spi.chip().resets, 3);
        assert!(rig.clock.now_ms() >= (RESET_PULSE_MS + RESET_SETTLE_MS) as u64);
        assert_eq!(rig.link.mac_address(), MAC);
    }
}
