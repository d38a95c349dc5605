//! # Bias board emulator
//!
//! Holds the state of a simulated PATE bias board and answers the same ASCII
//! commands as the real hardware, so the console can be developed and tested
//! without one. [`Loopback`] exposes it as an in-memory [`Connection`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use thiserror::Error;

use crate::connection::Connection;
use crate::protocol::{FIELD_COUNT, PWM_CHANNELS, PWM_MAX};

/// Reasons the emulator answers `ERROR`.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The line is not a command the board knows.
    #[error("unrecognized command {0:?}")]
    Unrecognized(String),
    /// PWM channel outside 1..=4.
    #[error("invalid PWM channel")]
    InvalidChannel,
    /// The command's numeric parameter did not parse or is out of range.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The measurement selector does not exist.
    #[error("unknown measurement selector {0:02}")]
    UnknownSelector(u8),
}

/// Firmware string reported by `VERS?`.
pub const EMULATOR_VERSION: &str = "pbb-emulator version 1.0";

/// Delay between the progress dots of a calibration cycle.
pub const CALIBRATION_DOT_INTERVAL: Duration = Duration::from_millis(500);

const CALIBRATION_DOTS: usize = 10;

/// Physical unit appended to single-field replies.
fn unit(selector: u8) -> Option<&'static str> {
    match selector {
        0..=3 => Some("V"),
        4 | 5 | 18 => Some("mV"),
        6 | 10..=13 | 15 | 17 => Some("mA"),
        14 | 16 => Some("C"),
        _ => None,
    }
}

/// Formats a field the way the firmware pads it.
fn format_field(selector: u8, value: i32) -> String {
    match selector {
        0..=3 => format!("{:03}", value),
        4 | 5 | 18 => format!("{:04}", value),
        // Negative currents take one extra character for the sign.
        6 | 10..=13 | 15 | 17 if value < 0 => format!("{:03}", value),
        6 | 10..=17 => format!("{:02}", value),
        _ => value.to_string(),
    }
}

/// State of the simulated bias board.
#[derive(Debug, Clone)]
pub struct BoardEmulator {
    pwm: [u16; 4],
    fields: [i32; FIELD_COUNT],
    calibrations: u32,
}

impl BoardEmulator {
    /// Creates a board with the power-on PWM values and plausible readings.
    pub fn new() -> Self {
        let mut fields = [0; FIELD_COUNT];
        fields[..4].copy_from_slice(&[120, 121, 119, 122]);
        fields[4] = 1500;
        fields[5] = 1510;
        fields[6] = 42;
        fields[10..14].copy_from_slice(&[10, 11, 10, 12]);
        fields[14] = 31;
        fields[15] = 5;
        fields[16] = 33;
        fields[17] = 4;
        fields[18] = 3300;
        Self {
            pwm: [25, 25, 25, 35],
            fields,
            calibrations: 0,
        }
    }

    /// Current value of PWM channel `channel` (1..=4).
    pub fn pwm(&self, channel: u8) -> Option<u16> {
        PWM_CHANNELS
            .contains(&channel)
            .then(|| self.pwm[usize::from(channel - 1)])
    }

    /// Overrides the value reported for a measurement selector.
    pub fn set_field(&mut self, selector: u8, value: i32) {
        if let Some(field) = self.fields.get_mut(usize::from(selector)) {
            *field = value;
        }
    }

    /// Number of completed `RRR` cycles.
    pub fn calibrations(&self) -> u32 {
        self.calibrations
    }

    /// Processes one command line (without terminator) and returns the full
    /// reply text, or the reason the board answers `ERROR`.
    pub fn process_command(&mut self, line: &str) -> Result<String, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line == "VERS?" {
            return Ok(format!("{}\nOK\n", EMULATOR_VERSION));
        }
        if line == "RRR" {
            self.calibrations += 1;
            let mut transcript = String::from(CALIBRATION_PREAMBLE);
            transcript.push_str(&".".repeat(CALIBRATION_DOTS));
            transcript.push_str(CALIBRATION_RESULT);
            return Ok(transcript);
        }
        if let Some(rest) = line.strip_prefix("MEAS") {
            let selector = rest
                .strip_suffix('?')
                .filter(|s| s.len() == 2)
                .and_then(|s| s.parse::<u8>().ok())
                .ok_or(CommandError::InvalidParameter)?;
            return self.measurement(selector).map(|value| format!("{}\nOK\n", value));
        }
        if let Some(rest) = line.strip_prefix("PWM") {
            let channel = rest
                .get(..1)
                .and_then(|c| c.parse::<u8>().ok())
                .filter(|c| PWM_CHANNELS.contains(c))
                .ok_or(CommandError::InvalidChannel)?;
            let slot = usize::from(channel - 1);
            return match &rest[1..] {
                "?" => Ok(format!("{:03}\nOK\n", self.pwm[slot])),
                set if set.starts_with('S') && set.len() == 4 => {
                    let value = set[1..]
                        .parse::<u16>()
                        .ok()
                        .filter(|v| *v <= PWM_MAX)
                        .ok_or(CommandError::InvalidParameter)?;
                    self.pwm[slot] = value;
                    Ok(format!("{:03}\nOK\n", value))
                }
                _ => Err(CommandError::InvalidParameter),
            };
        }
        Err(CommandError::Unrecognized(line.to_string()))
    }

    /// Like [`process_command`](Self::process_command) but folds every error
    /// into the `ERROR` line the hardware sends.
    pub fn reply(&mut self, line: &str) -> String {
        match self.process_command(line) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(command = line, error = %e, "emulator replies ERROR");
                String::from("ERROR\n")
            }
        }
    }

    fn measurement(&self, selector: u8) -> Result<String, CommandError> {
        if selector == crate::protocol::ALL_FIELDS {
            let line = (0..FIELD_COUNT as u8)
                .map(|n| match unit(n) {
                    Some(_) => format_field(n, self.fields[usize::from(n)]),
                    None => String::from("0"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            return Ok(line);
        }
        let unit = unit(selector).ok_or(CommandError::UnknownSelector(selector))?;
        Ok(format!(
            "{} {}",
            format_field(selector, self.fields[usize::from(selector)]),
            unit
        ))
    }
}

impl Default for BoardEmulator {
    fn default() -> Self {
        Self::new()
    }
}

/// First part of the calibration transcript, before the progress dots.
pub const CALIBRATION_PREAMBLE: &str = "Zero levels are to be calibrated.\nShutting down, please wait";

/// Last part of the calibration transcript, after the progress dots.
pub const CALIBRATION_RESULT: &str = "\n6       19      36      -7      296\nOK\n";

/// The emulator as an in-memory connection. Every complete line written is
/// processed immediately and its reply queued for reading.
pub struct Loopback {
    board: BoardEmulator,
    line: Vec<u8>,
    rx: VecDeque<u8>,
    timeout: Duration,
}

impl Loopback {
    pub fn new(board: BoardEmulator) -> Self {
        Self {
            board,
            line: Vec::new(),
            rx: VecDeque::new(),
            timeout: Duration::from_millis(100),
        }
    }

    pub fn board(&self) -> &BoardEmulator {
        &self.board
    }

    /// Queues bytes as if the board had sent them unprompted.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }
}

impl Read for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        self.rx.read(buf)
    }
}

impl Write for Loopback {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                let command = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                let reply = self.board.reply(&command);
                self.rx.extend(reply.as_bytes());
            } else {
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for Loopback {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn parameters(&self) -> String {
        String::from("loopback")
    }
}
