//! The byte pipe to the target's boot UART, plus its reset line.

use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::SerialPort;

use crate::{Error, OurContext};

/// A serial link to the target. The target's reset line hangs off a modem
/// control signal of the same port.
pub trait Link: Read + Write {
    /// Drives the reset line. `true` lets the target run.
    fn set_reset_released(&mut self, released: bool) -> Result<(), Error>;
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
}

impl Link for Box<dyn SerialPort> {
    fn set_reset_released(&mut self, released: bool) -> Result<(), Error> {
        self.write_data_terminal_ready(released)
            .context("driving reset line (DTR)")
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        (**self).set_timeout(timeout)?;
        Ok(())
    }
}

/// Opens a serial port for use as a link or pulse generator channel.
pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>, Error> {
    let port = serialport::new(path, baud_rate)
        .timeout(timeout)
        .open()
        .with_context(|| format!("opening serial port {path}"))?;
    log::info!("opened serial port {path} at {baud_rate} baud");
    Ok(port)
}

/// Throws away whatever the target already said. Returns the number of bytes
/// discarded.
pub fn drain<L: Link + ?Sized>(link: &mut L) -> Result<usize, Error> {
    let saved_timeout = link.timeout();
    link.set_timeout(Duration::from_millis(1))
        .context("reducing timeout for drain")?;

    let mut link = scopeguard::guard(link, |link| {
        if let Err(e) = link.set_timeout(saved_timeout) {
            log::warn!("restoring timeout after drain: {e}");
        }
    });

    let mut buffer = [0; 32];
    let mut cruft = 0_usize;
    loop {
        match link.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => cruft += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e).context("attempting to drain buffer"),
        }
    }

    if cruft > 0 {
        log::debug!("{cruft} bytes of cruft drained from control channel");
    }
    Ok(cruft)
}

/// Reads until `count` bytes have arrived or a read times out, and returns
/// whatever showed up. Short results are the caller's problem; for exact
/// pattern matching they simply fail to match.
pub fn read_up_to<L: Link + ?Sized>(link: &mut L, count: usize) -> Result<Vec<u8>, Error> {
    let mut data = vec![0; count];
    let mut filled = 0;
    while filled < count {
        match link.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e.into()),
        }
    }
    data.truncate(filled);
    log::trace!("rx {data:02x?}");
    Ok(data)
}

/// Reads exactly `count` bytes, tolerating a driver that hands them over in
/// dribs and drabs. At most `rereads` reads in a row may come back empty,
/// with `backoff` between them; after that this gives up with
/// [`Error::Timeout`].
pub fn read_exact_bounded<L: Link + ?Sized>(
    link: &mut L,
    count: usize,
    rereads: u32,
    backoff: Duration,
) -> Result<Vec<u8>, Error> {
    let mut data = vec![0; count];
    let mut filled = 0;
    let mut empty_reads = 0;
    while filled < count {
        match link.read(&mut data[filled..]) {
            Ok(n) if n > 0 => {
                filled += n;
                empty_reads = 0;
                continue;
            }
            Ok(_) => (),
            Err(e) if e.kind() == ErrorKind::TimedOut => (),
            Err(e) => return Err(e.into()),
        }
        empty_reads += 1;
        if empty_reads > rereads {
            data.truncate(filled);
            return Err(Error::Timeout { wanted: count, got: data });
        }
        if !backoff.is_zero() {
            std::thread::sleep(backoff);
        }
    }
    log::trace!("rx {data:02x?}");
    Ok(data)
}

pub(crate) fn send<L: Link + ?Sized>(link: &mut L, bytes: &[u8]) -> Result<(), Error> {
    log::trace!("tx {bytes:02x?}");
    link.write_all(bytes)?;
    link.flush()?;
    Ok(())
}

/// An in-memory stand-in for the target.
#[cfg(test)]
pub(crate) mod script {
    use std::{
        collections::VecDeque,
        io::{self, ErrorKind, Read, Write},
        time::Duration,
    };

    use super::Link;
    use crate::Error;

    /// Replays canned device output. Each queued boot becomes readable when
    /// the reset line is released, the way a real target only starts talking
    /// after it comes out of reset.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedLink {
        boots: VecDeque<Vec<u8>>,
        rx: VecDeque<u8>,
        splits: Vec<usize>,
        next_split: usize,
        stall_every: Option<usize>,
        failed_writes: usize,
        reads: usize,
        released: bool,
        timeout: Duration,
        pub(crate) sent: Vec<u8>,
        pub(crate) reset_log: Vec<bool>,
    }

    impl ScriptedLink {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Bytes the device has already sent.
        pub(crate) fn with_rx(bytes: &[u8]) -> Self {
            let mut link = Self::new();
            link.rx.extend(bytes);
            link
        }

        /// Device output for the next time it comes out of reset.
        pub(crate) fn boot(mut self, bytes: impl Into<Vec<u8>>) -> Self {
            self.boots.push_back(bytes.into());
            self
        }

        /// Caps successive reads at these sizes, cycling.
        pub(crate) fn split_reads(mut self, splits: Vec<usize>) -> Self {
            assert!(splits.iter().all(|&s| s > 0));
            self.splits = splits;
            self
        }

        /// Every `n`th read times out without delivering anything.
        pub(crate) fn stall_every(mut self, n: usize) -> Self {
            self.stall_every = Some(n);
            self
        }

        /// The next `n` writes fail the way a yanked USB adapter does.
        pub(crate) fn fail_writes(mut self, n: usize) -> Self {
            self.failed_writes = n;
            self
        }

        pub(crate) fn released(&self) -> bool {
            self.released
        }

        pub(crate) fn unread(&self) -> usize {
            self.rx.len()
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if let Some(n) = self.stall_every {
                if self.reads % n == 0 {
                    return Err(ErrorKind::TimedOut.into());
                }
            }
            if self.rx.is_empty() {
                return Err(ErrorKind::TimedOut.into());
            }
            let mut n = buf.len().min(self.rx.len());
            if !self.splits.is_empty() {
                n = n.min(self.splits[self.next_split % self.splits.len()]);
                self.next_split += 1;
            }
            for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failed_writes > 0 {
                self.failed_writes -= 1;
                return Err(ErrorKind::BrokenPipe.into());
            }
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for ScriptedLink {
        fn set_reset_released(&mut self, released: bool) -> Result<(), Error> {
            self.reset_log.push(released);
            if released && !self.released {
                if let Some(boot) = self.boots.pop_front() {
                    self.rx.extend(boot);
                }
            }
            self.released = released;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
            self.timeout = timeout;
            Ok(())
        }
    }
}
