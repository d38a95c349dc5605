//! The byte stream a [`Device`](crate::device::Device) talks over.
//!
//! Real hardware is reached through `serialport`; tests and the emulator use
//! in-memory implementations of the same trait.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::config::SerialConfig;

/// A duplex byte stream with a single read/write timeout.
///
/// Reads block for at most [`timeout`](Connection::timeout) and report
/// `io::ErrorKind::TimedOut` when nothing arrived. Writes that cannot be
/// completed within the timeout report the same kind.
pub trait Connection: Read + Write {
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drops every byte the connection has received but not yet delivered.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Line settings in the `baud,bits,parity,stop` form, e.g. `115200,8,N,1`.
    fn parameters(&self) -> String {
        String::from("?")
    }
}

impl Connection for Box<dyn SerialPort> {
    fn timeout(&self) -> Duration {
        SerialPort::timeout(self.as_ref())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn parameters(&self) -> String {
        let baud = self
            .baud_rate()
            .map(|b| b.to_string())
            .unwrap_or_else(|_| String::from("?"));
        let bits = match self.data_bits() {
            Ok(DataBits::Five) => "5",
            Ok(DataBits::Six) => "6",
            Ok(DataBits::Seven) => "7",
            Ok(DataBits::Eight) => "8",
            Err(_) => "?",
        };
        let parity = match self.parity() {
            Ok(Parity::None) => "N",
            Ok(Parity::Odd) => "O",
            Ok(Parity::Even) => "E",
            Err(_) => "?",
        };
        let stop = match self.stop_bits() {
            Ok(StopBits::One) => "1",
            Ok(StopBits::Two) => "2",
            Err(_) => "?",
        };
        format!("{},{},{},{}", baud, bits, parity, stop)
    }
}

/// Opens the configured serial port (8N1) for exclusive use and flushes any
/// stale input.
pub fn open(config: &SerialConfig) -> serialport::Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&config.device, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(config.timeout());

    #[cfg(unix)]
    let port: Box<dyn SerialPort> = {
        let mut native = builder.open_native()?;
        native.set_exclusive(true)?;
        Box::new(native)
    };
    #[cfg(not(unix))]
    let port = builder.open()?;

    port.clear(ClearBuffer::Input)?;
    tracing::debug!(device = %config.device, "serial port opened");
    Ok(port)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// One step of a scripted reply stream.
    pub(crate) enum Chunk {
        Data(Vec<u8>),
        /// The next read times out.
        Stall,
        /// The next read fails with this error.
        Fail(io::ErrorKind),
    }

    /// A connection that replays a fixed script and records what was written.
    pub(crate) struct ScriptedConnection {
        script: VecDeque<Chunk>,
        pub written: Vec<u8>,
        pub discards: usize,
        pub fail_writes: bool,
        timeout: Duration,
    }

    impl ScriptedConnection {
        pub(crate) fn new(script: Vec<Chunk>) -> Self {
            Self {
                script: script.into(),
                written: Vec::new(),
                discards: 0,
                fail_writes: false,
                timeout: Duration::from_millis(100),
            }
        }

        pub(crate) fn replying(reply: &str) -> Self {
            Self::new(vec![Chunk::Data(reply.as_bytes().to_vec())])
        }

        pub(crate) fn remaining(&self) -> usize {
            self.script.len()
        }

        pub(crate) fn written_str(&self) -> &str {
            std::str::from_utf8(&self.written).unwrap()
        }
    }

    impl Read for ScriptedConnection {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Chunk::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.script.push_front(Chunk::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Chunk::Fail(kind)) => Err(kind.into()),
                Some(Chunk::Stall) | None => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for ScriptedConnection {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::TimedOut.into());
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Connection for ScriptedConnection {
        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.discards += 1;
            self.script.clear();
            Ok(())
        }

        fn parameters(&self) -> String {
            String::from("115200,8,N,1")
        }
    }
}
