/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::trace;

use super::CONSOLE_TICKS;
use crate::kernel::Kernel;
use crate::stats::Statistics;

/// Where console input comes from and output goes. Defaults to the host
/// stdin/stdout; tests and batch runs attach files or an in-memory buffer.
pub enum ConsoleSource {
    Stdin,
    File(File),
    Buffer(Vec<u8>, usize),
}

pub enum ConsoleSink {
    Stdout,
    File(File),
    Buffer(Vec<u8>),
}

struct ConsoleInner {
    source: ConsoleSource,
    sink: ConsoleSink,
    incoming: Option<Option<u8>>,
}

/// Simulated character console. Reads and writes complete via interrupts a
/// few ticks after the request, like the disk. Character arrival is polled
/// only while a read request is outstanding, so an otherwise idle machine
/// quiesces. End of input is delivered as a `None` character.
pub struct Console {
    inner: Mutex<ConsoleInner>,
    read_done: Box<dyn Fn(&Arc<Kernel>) + Send + Sync>,
    write_done: Box<dyn Fn(&Arc<Kernel>) + Send + Sync>,
}

impl Console {
    pub fn new(
        source: ConsoleSource,
        sink: ConsoleSink,
        read_done: impl Fn(&Arc<Kernel>) + Send + Sync + 'static,
        write_done: impl Fn(&Arc<Kernel>) + Send + Sync + 'static,
    ) -> Self {
        Console {
            inner: Mutex::new(ConsoleInner {
                source,
                sink,
                incoming: None,
            }),
            read_done: Box::new(read_done),
            write_done: Box::new(write_done),
        }
    }

    pub fn source_from_path(path: Option<&str>) -> anyhow::Result<ConsoleSource> {
        match path {
            None => Ok(ConsoleSource::Stdin),
            Some(p) => {
                let file = File::open(Path::new(p))
                    .with_context(|| format!("failed to open console input '{}'", p))?;
                Ok(ConsoleSource::File(file))
            }
        }
    }

    pub fn sink_from_path(path: Option<&str>) -> anyhow::Result<ConsoleSink> {
        match path {
            None => Ok(ConsoleSink::Stdout),
            Some(p) => {
                let file = File::create(Path::new(p))
                    .with_context(|| format!("failed to create console output '{}'", p))?;
                Ok(ConsoleSink::File(file))
            }
        }
    }

    /// Requests one character; `read_done` fires once it has arrived and
    /// `take_char` yields it (`None` at end of input).
    pub fn request_char(&self, kernel: &Arc<Kernel>) {
        kernel.interrupt.schedule(CONSOLE_TICKS, "console-read", |k| {
            let console = k.synch_console.raw();
            let ch = {
                let mut inner = console.inner.lock().unwrap();
                let ch = inner.read_byte();
                inner.incoming = Some(ch);
                ch
            };
            trace!(target: "console", "char arrived: {:?}", ch);
            if ch.is_some() {
                Statistics::bump(&k.stats.console_chars_in);
            }
            (console.read_done)(k);
        });
    }

    pub fn take_char(&self) -> Option<u8> {
        self.inner
            .lock()
            .unwrap()
            .incoming
            .take()
            .expect("console take_char with no completed read")
    }

    /// Emits one character; `write_done` fires when the device is ready for
    /// the next one.
    pub fn put_char(&self, kernel: &Arc<Kernel>, ch: u8) -> io::Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.write_byte(ch)?;
        }
        Statistics::bump(&kernel.stats.console_chars_out);
        kernel.interrupt.schedule(CONSOLE_TICKS, "console-write", |k| {
            let console = k.synch_console.raw();
            (console.write_done)(k);
        });
        Ok(())
    }

    /// Drains and returns everything written so far, for buffer sinks.
    pub fn take_output(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.sink {
            ConsoleSink::Buffer(buf) => std::mem::take(buf),
            _ => Vec::new(),
        }
    }
}

impl ConsoleInner {
    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        let n = match &mut self.source {
            ConsoleSource::Stdin => io::stdin().read(&mut byte).unwrap_or(0),
            ConsoleSource::File(f) => f.read(&mut byte).unwrap_or(0),
            ConsoleSource::Buffer(data, pos) => {
                if *pos < data.len() {
                    byte[0] = data[*pos];
                    *pos += 1;
                    1
                } else {
                    0
                }
            }
        };
        if n == 0 {
            None
        } else {
            Some(byte[0])
        }
    }

    fn write_byte(&mut self, ch: u8) -> io::Result<()> {
        match &mut self.sink {
            ConsoleSink::Stdout => io::stdout().write_all(&[ch]),
            ConsoleSink::File(f) => f.write_all(&[ch]),
            ConsoleSink::Buffer(buf) => {
                buf.push(ch);
                Ok(())
            }
        }
    }
}
