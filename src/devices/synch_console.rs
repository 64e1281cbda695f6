/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::machine::console::{Console, ConsoleSink, ConsoleSource};
use crate::sync::lock::Lock;
use crate::sync::semaphore::Semaphore;

/// Blocking wrapper around the asynchronous console: single-character read
/// and write, one lock per direction, completion semaphores posted by the
/// device interrupts. End of input reads as `None`.
pub struct SynchConsole {
    console: Console,
    read_lock: Lock,
    write_lock: Lock,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
}

impl SynchConsole {
    pub fn new(source: ConsoleSource, sink: ConsoleSink) -> Self {
        let read_avail = Arc::new(Semaphore::new("console-read", 0));
        let write_done = Arc::new(Semaphore::new("console-write", 0));
        let ra = read_avail.clone();
        let wd = write_done.clone();
        let console = Console::new(source, sink, move |k| ra.v(k), move |k| wd.v(k));
        SynchConsole {
            console,
            read_lock: Lock::new("console-read"),
            write_lock: Lock::new("console-write"),
            read_avail,
            write_done,
        }
    }

    pub(crate) fn raw(&self) -> &Console {
        &self.console
    }

    pub fn read_char(&self, kernel: &Arc<Kernel>) -> Option<u8> {
        self.read_lock.acquire(kernel);
        self.console.request_char(kernel);
        self.read_avail.p(kernel);
        let ch = self.console.take_char();
        self.read_lock.release(kernel);
        ch
    }

    pub fn write_char(&self, kernel: &Arc<Kernel>, ch: u8) -> io::Result<()> {
        self.write_lock.acquire(kernel);
        let result = self.console.put_char(kernel, ch);
        if result.is_ok() {
            self.write_done.p(kernel);
        }
        self.write_lock.release(kernel);
        result
    }

    /// Writes a whole string, character at a time.
    pub fn write_str(&self, kernel: &Arc<Kernel>, s: &str) -> io::Result<()> {
        for b in s.bytes() {
            self.write_char(kernel, b)?;
        }
        Ok(())
    }

    /// Test access to a buffer-backed sink.
    pub fn take_output(&self) -> Vec<u8> {
        self.console.take_output()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::kernel::testing::temp_disk_image;
    use crate::kernel::Kernel;
    use crate::machine::console::{ConsoleSink, ConsoleSource};
    use crate::machine::machine::NoCpu;

    #[test]
    fn test_read_until_eof_and_write() {
        let kernel = Kernel::create(
            Config::default(),
            &temp_disk_image(),
            ConsoleSource::Buffer(b"hi".to_vec(), 0),
            ConsoleSink::Buffer(Vec::new()),
            Arc::new(NoCpu),
        )
        .unwrap();
        kernel.run(|k| {
            assert_eq!(k.synch_console.read_char(k), Some(b'h'));
            assert_eq!(k.synch_console.read_char(k), Some(b'i'));
            // End of input is a sentinel, not an error.
            assert_eq!(k.synch_console.read_char(k), None);
            k.synch_console.write_str(k, "ok").unwrap();
        });
        assert_eq!(kernel.synch_console.take_output(), b"ok".to_vec());
    }
}
