//! Command/response transactions with the bias board.
//!
//! A transaction writes one command line and reads either `OK`, `ERROR`, or a
//! value line followed by `OK`. Only one transaction is ever in flight; the
//! [`Device`] owns its connection exclusively.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::connection::Connection;
use crate::error::TransactionError;
use crate::protocol::{decode_fields, decode_reading, Command, Reading, ALL_FIELDS};

/// How long to wait after a read timeout before discarding buffered input.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(200);

/// Calibration fails when the board stays silent this long.
pub const CALIBRATION_SILENCE: Duration = Duration::from_secs(1);

/// A successfully framed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
}

/// The bias board, reached over an exclusively owned connection.
pub struct Device<C: Connection> {
    port: C,
    read_timeout: Duration,
    /// Received bytes not yet consumed as a complete line.
    pending: Vec<u8>,
    /// State altering commands issued since the last drain.
    commands: Vec<String>,
}

impl<C: Connection> Device<C> {
    /// Wraps a connection. The connection's timeout becomes the read timeout.
    pub fn new(port: C) -> Self {
        let read_timeout = port.timeout();
        Self {
            port,
            read_timeout,
            pending: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.port
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.port
    }

    /// Firmware identification string (`VERS?`).
    pub fn version(&mut self) -> Result<String, TransactionError> {
        match self.send(Command::Version)? {
            Reply::Value(text) => Ok(text),
            Reply::Ok => Ok(String::from("OK")),
        }
    }

    /// Queries one measurement selector (`MEASnn?`).
    pub fn measure(&mut self, selector: u8) -> Result<Reading, TransactionError> {
        let value = self.expect_value(Command::Measure(selector))?;
        decode_reading(selector, &value)
    }

    /// Queries every measurement field at once (`MEAS99?`).
    pub fn measure_all(&mut self) -> Result<Vec<i32>, TransactionError> {
        let value = self.expect_value(Command::Measure(ALL_FIELDS))?;
        decode_fields(&value)
    }

    /// Current duty cycle of a PWM channel (`PWMn?`).
    pub fn pwm(&mut self, channel: u8) -> Result<u16, TransactionError> {
        let value = self.expect_value(Command::PwmQuery(channel))?;
        parse_pwm(&value)
    }

    /// Sets a PWM channel (`PWMnSxxx`) and returns the value the board
    /// reports back. Failures are never swallowed: the caller cannot know
    /// whether the board applied the change.
    ///
    /// The command enters the command log only once the board has echoed
    /// a readable value.
    pub fn set_pwm(&mut self, channel: u8, value: u16) -> Result<u16, TransactionError> {
        let command = Command::PwmSet(channel, value);
        let applied = parse_pwm(&self.expect_value(command)?)?;
        self.commands.push(command.to_string());
        Ok(applied)
    }

    /// Returns all state altering commands issued since the previous call,
    /// comma separated, and forgets them.
    pub fn drain_commands(&mut self) -> String {
        std::mem::take(&mut self.commands).join(",")
    }

    pub fn serial_parameters(&self) -> String {
        self.port.parameters()
    }

    /// Runs the `RRR` calibration cycle. Every chunk the board streams is
    /// handed to `progress` as it arrives. The cycle ends on `OK`; `ERROR`
    /// fails it, as does [`CALIBRATION_SILENCE`] without new data.
    pub fn calibrate<F>(&mut self, mut progress: F) -> Result<(), TransactionError>
    where
        F: FnMut(&str),
    {
        self.discard_stale();
        self.write_command(Command::Calibrate)?;

        let saved = self.port.timeout();
        self.port.set_timeout(CALIBRATION_SILENCE)?;
        let result = self.stream_calibration(&mut progress);
        self.port.set_timeout(saved)?;
        result
    }

    fn stream_calibration(&mut self, progress: &mut dyn FnMut(&str)) -> Result<(), TransactionError> {
        let mut transcript = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            if transcript.ends_with(b"OK\n") {
                return Ok(());
            }
            if transcript.ends_with(b"ERROR\n") {
                error!("calibration failure");
                return Err(TransactionError::DeviceError);
            }
            match self.port.read(&mut chunk) {
                Ok(0) => return Err(self.resync(CALIBRATION_SILENCE)),
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    trace!(target: "pbbes::wire", rx = %text.escape_debug());
                    progress(&text);
                    transcript.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => return Err(self.resync(CALIBRATION_SILENCE)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs one complete transaction. The command log is left alone; see
    /// [`set_pwm`](Self::set_pwm).
    pub fn send(&mut self, command: Command) -> Result<Reply, TransactionError> {
        self.discard_stale();
        self.write_command(command)?;

        let first = self.read_line()?;
        let reply = match first.as_str() {
            "OK" => Reply::Ok,
            "ERROR" => {
                debug!(%command, "device replied ERROR");
                return Err(TransactionError::DeviceError);
            }
            _ => {
                let second = self.read_line()?;
                if second != "OK" {
                    error!(%command, value = %first, line = %second, "reply not terminated by OK");
                    return Err(TransactionError::ProtocolViolation { line: second });
                }
                Reply::Value(first)
            }
        };
        Ok(reply)
    }

    fn expect_value(&mut self, command: Command) -> Result<String, TransactionError> {
        match self.send(command)? {
            Reply::Value(value) => Ok(value),
            Reply::Ok => Err(TransactionError::InvalidValue {
                value: String::from("OK"),
            }),
        }
    }

    fn discard_stale(&mut self) {
        if !self.pending.is_empty() {
            warn!(bytes = self.pending.len(), "discarding unsolicited input");
            self.pending.clear();
        }
    }

    fn write_command(&mut self, command: Command) -> Result<(), TransactionError> {
        let line = format!("{}\n", command);
        trace!(target: "pbbes::wire", tx = %command);
        let written = self
            .port
            .write_all(line.as_bytes())
            .and_then(|_| self.port.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) if is_timeout(e.kind()) => {
                error!(%command, "serial write timeout");
                Err(TransactionError::WriteTimeout(self.port.timeout()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one `\n` terminated line, without the terminator.
    fn read_line(&mut self) -> Result<String, TransactionError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = [0u8; 64];
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                let text = String::from_utf8_lossy(&line[..end])
                    .trim_end_matches('\r')
                    .to_string();
                trace!(target: "pbbes::wire", rx = %text);
                return Ok(text);
            }
            if Instant::now() >= deadline {
                return Err(self.resync(self.read_timeout));
            }
            match self.port.read(&mut chunk) {
                Ok(0) => return Err(self.resync(self.read_timeout)),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => return Err(self.resync(self.read_timeout)),
                Err(e) => {
                    error!(error = %e, "serial read failure");
                    return Err(e.into());
                }
            }
        }
    }

    /// Lets the board finish whatever it was sending, then throws it all
    /// away so the next transaction starts on a line boundary.
    fn resync(&mut self, waited: Duration) -> TransactionError {
        warn!(?waited, partial = %String::from_utf8_lossy(&self.pending), "serial read timeout");
        thread::sleep(TIMEOUT_GRACE);
        self.pending.clear();
        if let Err(e) = self.port.discard_input() {
            error!(error = %e, "could not discard serial input");
        }
        TransactionError::ReadTimeout(waited)
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn parse_pwm(value: &str) -> Result<u16, TransactionError> {
    value
        .trim()
        .parse()
        .map_err(|_| TransactionError::InvalidValue {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{Chunk, ScriptedConnection};

    fn device(reply: &str) -> Device<ScriptedConnection> {
        Device::new(ScriptedConnection::replying(reply))
    }

    // --- Reply framing ---

    #[test]
    fn value_followed_by_ok() {
        let mut dev = device("VALUE\nOK\n");
        assert_eq!(dev.send(Command::Version).unwrap(), Reply::Value(String::from("VALUE")));
        assert_eq!(dev.get_ref().written_str(), "VERS?\n");
    }

    #[test]
    fn bare_ok() {
        let mut dev = device("OK\n");
        assert_eq!(dev.send(Command::Version).unwrap(), Reply::Ok);
    }

    #[test]
    fn bare_error() {
        let mut dev = device("ERROR\n");
        assert!(matches!(dev.send(Command::Measure(7)), Err(TransactionError::DeviceError)));
    }

    #[test]
    fn junk_after_value() {
        let mut dev = device("VALUE\nJUNK\n");
        let err = dev.send(Command::Version).unwrap_err();
        assert!(matches!(err, TransactionError::ProtocolViolation { ref line } if line == "JUNK"));
        assert!(err.is_fatal());
    }

    #[test]
    fn reply_split_across_reads() {
        let conn = ScriptedConnection::new(vec![
            Chunk::Data(b"12".to_vec()),
            Chunk::Data(b"3 V\nO".to_vec()),
            Chunk::Data(b"K\n".to_vec()),
        ]);
        let mut dev = Device::new(conn);
        assert_eq!(dev.measure(0).unwrap(), Reading::Value(123));
    }

    #[test]
    fn carriage_return_is_tolerated() {
        let mut dev = device("042\r\nOK\r\n");
        assert_eq!(dev.pwm(1).unwrap(), 42);
    }

    // --- Selector decoding ---

    #[test]
    fn measure_selector_widths() {
        let mut dev = device("123 V\nOK\n");
        assert_eq!(dev.measure(0).unwrap(), Reading::Value(123));
        assert_eq!(dev.get_ref().written_str(), "MEAS00?\n");

        let mut dev = device("1234 mV\nOK\n");
        assert_eq!(dev.measure(4).unwrap(), Reading::Value(1234));
    }

    #[test]
    fn measure_all_fields() {
        let line = (100..119).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let mut dev = device(&format!("{}\nOK\n", line));
        let fields = dev.measure_all().unwrap();
        assert_eq!(fields.len(), 19);
        assert_eq!(fields, (100..119).collect::<Vec<i32>>());
    }

    #[test]
    fn measure_all_rejects_non_numeric_field() {
        let mut dev = device("1 2 x 4\nOK\n");
        let err = dev.measure_all().unwrap_err();
        assert!(matches!(err, TransactionError::InvalidValue { ref value } if value == "1 2 x 4"));
        assert_eq!(dev.get_ref().written_str(), "MEAS99?\n");
    }

    #[test]
    fn unknown_selector_does_not_fail() {
        let mut dev = device("55 ?\nOK\n");
        assert_eq!(dev.measure(42).unwrap(), Reading::Unhandled(String::from("n=42")));
    }

    // --- Timeouts ---

    #[test]
    fn read_timeout_discards_buffered_input() {
        let conn = ScriptedConnection::new(vec![
            Chunk::Data(b"12".to_vec()),
            Chunk::Stall,
            Chunk::Data(b"3 V\nOK\n".to_vec()),
        ]);
        let mut dev = Device::new(conn);
        let err = dev.measure(0).unwrap_err();
        assert!(matches!(err, TransactionError::ReadTimeout(_)));
        assert!(!err.is_fatal());
        assert_eq!(dev.get_ref().discards, 1);
        assert_eq!(dev.get_ref().remaining(), 0);
        assert!(dev.pending.is_empty());
    }

    #[test]
    fn missing_second_line_times_out() {
        let mut dev = device("VALUE\n");
        assert!(matches!(dev.send(Command::Version), Err(TransactionError::ReadTimeout(_))));
    }

    #[test]
    fn write_timeout_is_fatal_and_not_logged() {
        let mut conn = ScriptedConnection::replying("100\nOK\n");
        conn.fail_writes = true;
        let mut dev = Device::new(conn);
        let err = dev.set_pwm(1, 100).unwrap_err();
        assert!(matches!(err, TransactionError::WriteTimeout(_)));
        assert!(err.is_fatal());
        assert_eq!(dev.drain_commands(), "");
    }

    // --- Command log ---

    #[test]
    fn accepted_settings_are_logged_in_order() {
        let mut dev = device("100\nOK\n050\nOK\n025\nOK\n");
        assert_eq!(dev.set_pwm(1, 100).unwrap(), 100);
        assert_eq!(dev.set_pwm(2, 50).unwrap(), 50);
        assert_eq!(dev.pwm(3).unwrap(), 25);
        assert_eq!(dev.get_ref().written_str(), "PWM1S100\nPWM2S050\nPWM3?\n");
        assert_eq!(dev.drain_commands(), "PWM1S100,PWM2S050");
        assert_eq!(dev.drain_commands(), "");
    }

    #[test]
    fn rejected_setting_is_not_logged() {
        let mut dev = device("ERROR\n");
        assert!(matches!(dev.set_pwm(5, 1), Err(TransactionError::DeviceError)));
        assert_eq!(dev.drain_commands(), "");
    }

    #[test]
    fn unconfirmed_setting_is_not_logged() {
        let mut dev = device("OK\n");
        let err = dev.set_pwm(1, 100).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidValue { ref value } if value == "OK"));
        assert_eq!(dev.drain_commands(), "");

        let mut dev = device("1x0\nOK\n");
        assert!(matches!(dev.set_pwm(1, 100), Err(TransactionError::InvalidValue { .. })));
        assert_eq!(dev.drain_commands(), "");
    }

    #[test]
    fn command_logs_are_per_device() {
        let mut first = device("100\nOK\n");
        let mut second = device("200\nOK\n");
        first.set_pwm(1, 100).unwrap();
        second.set_pwm(2, 200).unwrap();
        assert_eq!(first.drain_commands(), "PWM1S100");
        assert_eq!(second.drain_commands(), "PWM2S200");
    }

    // --- Calibration ---

    #[test]
    fn calibration_streams_until_ok() {
        let conn = ScriptedConnection::new(vec![
            Chunk::Data(b"Shutting down, please wait".to_vec()),
            Chunk::Data(b".".to_vec()),
            Chunk::Data(b".".to_vec()),
            Chunk::Data(b"\n6 19 36 -7 296\nOK\n".to_vec()),
        ]);
        let mut dev = Device::new(conn);
        let mut seen = String::new();
        dev.calibrate(|chunk| seen.push_str(chunk)).unwrap();
        assert!(seen.starts_with("Shutting down"));
        assert!(seen.ends_with("OK\n"));
        assert_eq!(dev.get_ref().written_str(), "RRR\n");
        assert_eq!(dev.get_ref().timeout(), Duration::from_millis(100));
    }

    #[test]
    fn calibration_error_reply() {
        let mut dev = device("Zero levels...\nERROR\n");
        assert!(matches!(dev.calibrate(|_| {}), Err(TransactionError::DeviceError)));
    }

    #[test]
    fn calibration_silence_times_out() {
        let conn = ScriptedConnection::new(vec![Chunk::Data(b"..".to_vec()), Chunk::Stall]);
        let mut dev = Device::new(conn);
        assert!(matches!(dev.calibrate(|_| {}), Err(TransactionError::ReadTimeout(_))));
    }
}
