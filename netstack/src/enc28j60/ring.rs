// Receive ring cursor over the controller's buffer memory
use super::regs::{RXSTART, RXSTOP};

/// Fixed window `start..=end` in buffer memory with the address of the
/// next unread frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRing {
    start: u16,
    end: u16,
    next: u16,
}

impl RxRing {
    pub const fn new(start: u16, end: u16) -> Self {
        RxRing { start, end, next: start }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn next(&self) -> u16 {
        self.next
    }

    pub fn capacity(&self) -> u16 {
        self.end - self.start + 1
    }

    pub fn contains(&self, addr: u16) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// The hardware writes frames on even boundaries only.
    pub fn validate_next(&self, addr: u16) -> bool {
        self.contains(addr) && addr % 2 == 0
    }

    pub fn advance(&mut self, next: u16) {
        self.next = next;
    }

    pub fn reset(&mut self) {
        self.next = self.start;
    }

    /// Value for ERXRDPT after consuming up to `next`. The controller
    /// corrupts the ring when ERXRDPT is even, so it trails by one byte.
    pub fn release_pointer(&self) -> u16 {
        if self.next == self.start {
            self.end
        } else {
            self.next - 1
        }
    }

    /// Address `offset` bytes after `addr`, wrapping inside the window.
    pub fn offset(&self, addr: u16, offset: u16) -> u16 {
        let relative = (addr - self.start) as u32 + offset as u32;
        self.start + (relative % self.capacity() as u32) as u16
    }

    /// Bytes between the read cursor and the hardware write pointer.
    pub fn used(&self, write_ptr: u16) -> u16 {
        if write_ptr >= self.next {
            write_ptr - self.next
        } else {
            self.capacity() - (self.next - write_ptr)
        }
    }
}

impl Default for RxRing {
    fn default() -> Self {
        RxRing::new(RXSTART, RXSTOP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_pointer_trails_cursor() {
        let mut ring = RxRing::default();
        assert_eq!(ring.release_pointer(), RXSTOP);
        ring.advance(0x0100);
        assert_eq!(ring.release_pointer(), 0x00FF);
        ring.reset();
        assert_eq!(ring.next(), RXSTART);
    }

    #[test]
    fn test_wraparound_arithmetic() {
        let mut ring = RxRing::new(0x0000, 0x00FF);
        assert_eq!(ring.capacity(), 0x100);
        assert_eq!(ring.offset(0x00F0, 0x20), 0x0010);
        assert_eq!(ring.offset(0x0010, 0x20), 0x0030);

        ring.advance(0x00F0);
        assert_eq!(ring.used(0x00F8), 8);
        assert_eq!(ring.used(0x0010), 0x20);
        assert_eq!(ring.used(0x00F0), 0);
    }

    #[test]
    fn test_next_pointer_validation() {
        let ring = RxRing::default();
        assert!(ring.validate_next(0x0000));
        assert!(ring.validate_next(0x19FE));
        assert!(!ring.validate_next(0x0101));
        assert!(!ring.validate_next(0x1A00));
    }
}
