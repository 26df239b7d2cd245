//! Kernel log ring: a fixed-capacity buffer of formatted, timestamped
//! entries behind the `log` crate facade. Subsystems log with
//! `log::info!` and friends; entries below the record threshold are
//! dropped, and entries at or above the console threshold are mirrored to
//! the UART immediately. klog_dump prints the ring in insertion order.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

use crate::param::{KLOG_CAP, KLOG_LINE_MAX};
use crate::printf;
use crate::spinlock::SpinLock;

#[derive(Clone, Copy)]
struct Entry {
    ticks: u64,
    level: Level,
    len: usize,
    line: [u8; KLOG_LINE_MAX],
}

const EMPTY: Entry = Entry {
    ticks: 0,
    level: Level::Info,
    len: 0,
    line: [0; KLOG_LINE_MAX],
};

struct Ring {
    entries: [Entry; KLOG_CAP],
    head: usize, // next slot to write
    len: usize,
}

pub struct Klog {
    ring: SpinLock<Ring>,
    record: AtomicUsize,  // LevelFilter as usize
    console: AtomicUsize, // LevelFilter as usize
}

/// Truncating formatter into a fixed line buffer.
struct LineWriter<'a> {
    buf: &'a mut [u8; KLOG_LINE_MAX],
    pos: usize,
}

impl Write for LineWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.pos >= KLOG_LINE_MAX {
                break; // silently truncate long messages
            }
            self.buf[self.pos] = b;
            self.pos += 1;
        }
        Ok(())
    }
}

impl Klog {
    pub const fn new() -> Klog {
        Klog {
            ring: SpinLock::new(
                "klog",
                Ring {
                    entries: [EMPTY; KLOG_CAP],
                    head: 0,
                    len: 0,
                },
            ),
            record: AtomicUsize::new(LevelFilter::Info as usize),
            console: AtomicUsize::new(LevelFilter::Error as usize),
        }
    }

    /// Install this ring as the `log` facade sink. Needs a &'static self,
    /// i.e. the kernel singleton.
    pub fn init(&'static self) {
        let _ = log::set_logger(self);
        log::set_max_level(LevelFilter::Debug);
    }

    /// record: entries below this are dropped entirely;
    /// console: entries at or above this also go to the UART right away.
    pub fn set_thresholds(&self, record: LevelFilter, console: LevelFilter) {
        self.record.store(record as usize, Ordering::Relaxed);
        self.console.store(console as usize, Ordering::Relaxed);
    }

    pub fn thresholds(&self) -> (usize, usize) {
        (
            self.record.load(Ordering::Relaxed),
            self.console.load(Ordering::Relaxed),
        )
    }

    /// Print the retained entries, oldest first.
    pub fn dump(&self) {
        let ring = self.ring.lock();
        printf!("klog: {} entries\n", ring.len);
        for k in 0..ring.len {
            let i = (ring.head + KLOG_CAP - ring.len + k) % KLOG_CAP;
            let e = &ring.entries[i];
            let msg = core::str::from_utf8(&e.line[..e.len]).unwrap_or("<bad utf8>");
            printf!("[{:5}] {:5} {}\n", e.ticks, e.level.as_str(), msg);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.ring.lock().len
    }

    #[cfg(test)]
    fn last_message(&self) -> Option<([u8; KLOG_LINE_MAX], usize)> {
        let ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let i = (ring.head + KLOG_CAP - 1) % KLOG_CAP;
        Some((ring.entries[i].line, ring.entries[i].len))
    }
}

impl log::Log for Klog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= self.record.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = [0u8; KLOG_LINE_MAX];
        let len = {
            let mut w = LineWriter {
                buf: &mut line,
                pos: 0,
            };
            let _ = write!(w, "{}", record.args());
            w.pos
        };
        let ticks = crate::trap::ticks_now();

        {
            let mut ring = self.ring.lock();
            let head = ring.head;
            ring.entries[head] = Entry {
                ticks,
                level: record.level(),
                len,
                line,
            };
            ring.head = (head + 1) % KLOG_CAP;
            if ring.len < KLOG_CAP {
                ring.len += 1;
            }
        }

        if record.level() as usize <= self.console.load(Ordering::Relaxed) {
            printf!(
                "[{:5}] {:5} {}\n",
                ticks,
                record.level().as_str(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

impl Default for Klog {
    fn default() -> Klog {
        Klog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn record(k: &Klog, level: Level, msg: &str) {
        // route through the trait like the facade would
        k.log(
            &Record::builder()
                .args(format_args!("{}", msg))
                .level(level)
                .target("test")
                .build(),
        );
    }

    #[test]
    fn records_at_or_above_threshold() {
        let k = Klog::new();
        k.set_thresholds(LevelFilter::Info, LevelFilter::Off);
        assert_eq!(k.entry_count(), 0);
        record(&k, Level::Info, "kept");
        record(&k, Level::Debug, "dropped");
        assert_eq!(k.entry_count(), 1);
        let (line, len) = k.last_message().unwrap();
        assert_eq!(&line[..len], b"kept");
    }

    #[test]
    fn ring_overwrites_oldest() {
        let k = Klog::new();
        k.set_thresholds(LevelFilter::Debug, LevelFilter::Off);
        for i in 0..(KLOG_CAP + 5) {
            k.log(
                &Record::builder()
                    .args(format_args!("m{}", i))
                    .level(Level::Info)
                    .build(),
            );
        }
        assert_eq!(k.entry_count(), KLOG_CAP);
        let (line, len) = k.last_message().unwrap();
        assert_eq!(&line[..len], format!("m{}", KLOG_CAP + 4).as_bytes());
    }

    #[test]
    fn long_messages_truncate() {
        let k = Klog::new();
        k.set_thresholds(LevelFilter::Debug, LevelFilter::Off);
        let long = "x".repeat(KLOG_LINE_MAX * 2);
        k.log(
            &Record::builder()
                .args(format_args!("{}", long))
                .level(Level::Warn)
                .build(),
        );
        let (_, len) = k.last_message().unwrap();
        assert_eq!(len, KLOG_LINE_MAX);
    }
}
