//! Low-level driver for the 16550a UART. Polled in both directions: the
//! console layer above owns buffering and the line discipline, this module
//! only moves bytes. On non-bare-metal targets it is an inert stub.

#[cfg(target_os = "none")]
mod hw {
    use crate::memlayout::UART0;

    // the UART control registers, byte-wide, at UART0.
    const RHR: usize = 0; // receive holding register (for input bytes)
    const THR: usize = 0; // transmit holding register (for output bytes)
    const IER: usize = 1; // interrupt enable register
    const FCR: usize = 2; // FIFO control register
    const LCR: usize = 3; // line control register
    const LSR: usize = 5; // line status register

    const FCR_FIFO_ENABLE: u8 = 1 << 0;
    const FCR_FIFO_CLEAR: u8 = 3 << 1;
    const LCR_EIGHT_BITS: u8 = 3;
    const LCR_BAUD_LATCH: u8 = 1 << 7;
    const LSR_RX_READY: u8 = 1 << 0;
    const LSR_TX_IDLE: u8 = 1 << 5;

    fn read_reg(r: usize) -> u8 {
        unsafe { ((UART0 + r) as *const u8).read_volatile() }
    }

    fn write_reg(r: usize, v: u8) {
        unsafe { ((UART0 + r) as *mut u8).write_volatile(v) }
    }

    pub fn init() {
        // disable interrupts; everything here is polled.
        write_reg(IER, 0);

        // 38.4K baud: latch, divisor LSB/MSB, unlatch into 8-bit mode.
        write_reg(LCR, LCR_BAUD_LATCH);
        write_reg(0, 0x03);
        write_reg(1, 0x00);
        write_reg(LCR, LCR_EIGHT_BITS);

        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
    }

    pub fn putc(c: u8) {
        while read_reg(LSR) & LSR_TX_IDLE == 0 {}
        write_reg(THR, c);
    }

    pub fn getc() -> Option<u8> {
        if read_reg(LSR) & LSR_RX_READY != 0 {
            Some(read_reg(RHR))
        } else {
            None
        }
    }
}

#[cfg(target_os = "none")]
pub use hw::{getc, init, putc};

#[cfg(not(target_os = "none"))]
pub fn init() {}

#[cfg(not(target_os = "none"))]
pub fn putc(_c: u8) {
    #[cfg(test)]
    std::print!("{}", _c as char);
}

#[cfg(not(target_os = "none"))]
pub fn getc() -> Option<u8> {
    None
}
