//! Console device (major number CONSOLE): byte sink to the UART on the
//! write side, a line-buffered reader with minimal editing on the read
//! side.

use crate::file::{register_device, Devsw, CONSOLE};
use crate::proc::{either_copyin, either_copyout, myproc};
use crate::spinlock::SpinLock;
use crate::uart;

const INPUT_BUF: usize = 128;
const STAGE: usize = 128;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const ESC: u8 = 0x1b;

struct Cons {
    buf: [u8; INPUT_BUF],
    r: usize, // read index
    w: usize, // write index (committed, readable)
    e: usize, // edit index (current line)
    esc: u8,  // CSI parser state: 0 idle, 1 saw ESC, 2 saw ESC [
}

static CONS: SpinLock<Cons> = SpinLock::new(
    "cons",
    Cons {
        buf: [0; INPUT_BUF],
        r: 0,
        w: 0,
        e: 0,
        esc: 0,
    },
);

pub fn console_init() {
    register_device(
        CONSOLE,
        Devsw {
            read: console_read,
            write: console_write,
        },
    );
}

impl Cons {
    fn echo(&self, c: u8) {
        if c == BACKSPACE || c == DELETE {
            // overwrite the erased character with a space.
            uart::putc(0x08);
            uart::putc(b' ');
            uart::putc(0x08);
        } else {
            uart::putc(c);
        }
    }

    /// Feed one raw byte through the line discipline.
    fn input(&mut self, c: u8) {
        // arrow keys arrive as ESC [ A..D; swallow the whole sequence.
        match self.esc {
            1 => {
                self.esc = if c == b'[' { 2 } else { 0 };
                return;
            }
            2 => {
                self.esc = 0;
                return;
            }
            _ => {}
        }
        if c == ESC {
            self.esc = 1;
            return;
        }

        let c = if c == b'\r' { b'\n' } else { c };

        if c == BACKSPACE || c == DELETE {
            if self.e != self.w {
                self.e -= 1;
                self.echo(BACKSPACE);
            }
            return;
        }

        if self.e - self.r < INPUT_BUF {
            self.echo(c);
            self.buf[self.e % INPUT_BUF] = c;
            self.e += 1;
            if c == b'\n' || self.e - self.r == INPUT_BUF {
                // commit the line; readers may consume it now.
                self.w = self.e;
            }
        }
    }
}

/// Read up to n bytes; returns when a full line has been delivered or the
/// count is reached. Input is gathered by polling the UART.
fn console_read(user: bool, addr: usize, n: usize) -> i32 {
    let mut total = 0usize;
    let mut cons = CONS.lock();

    while total < n {
        // wait for a committed byte, feeding the editor from the UART.
        while cons.r == cons.w {
            if myproc().map(crate::proc::killed).unwrap_or(false) {
                return -1;
            }
            if let Some(c) = uart::getc() {
                cons.input(c);
            } else {
                core::hint::spin_loop();
            }
        }

        let c = cons.buf[cons.r % INPUT_BUF];
        cons.r += 1;

        if either_copyout(user, addr + total, &[c]).is_err() {
            return -1;
        }
        total += 1;

        if c == b'\n' {
            break;
        }
    }

    total as i32
}

/// Copy bytes to the UART through a small staging buffer.
fn console_write(user: bool, addr: usize, n: usize) -> i32 {
    let mut stage = [0u8; STAGE];
    let mut written = 0usize;
    while written < n {
        let m = STAGE.min(n - written);
        if either_copyin(&mut stage[..m], user, addr + written).is_err() {
            return -1;
        }
        for &b in &stage[..m] {
            uart::putc(b);
        }
        written += m;
    }
    n as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Cons {
        Cons {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
            esc: 0,
        }
    }

    fn line(cons: &Cons) -> &[u8] {
        &cons.buf[cons.r..cons.w]
    }

    #[test]
    fn cr_maps_to_lf_and_commits() {
        let mut c = fresh();
        for b in *b"hi\r" {
            c.input(b);
        }
        assert_eq!(line(&c), b"hi\n");
    }

    #[test]
    fn backspace_erases_last_byte() {
        let mut c = fresh();
        for b in *b"hxy" {
            c.input(b);
        }
        c.input(DELETE);
        c.input(DELETE);
        for b in *b"i\n" {
            c.input(b);
        }
        assert_eq!(line(&c), b"hi\n");
        // backspacing into the committed region does nothing
        c.input(BACKSPACE);
        assert_eq!(line(&c), b"hi\n");
    }

    #[test]
    fn escape_sequences_are_discarded() {
        let mut c = fresh();
        c.input(b'a');
        for b in [ESC, b'[', b'A'] {
            c.input(b);
        }
        c.input(b'b');
        c.input(b'\n');
        assert_eq!(line(&c), b"ab\n");
    }
}
