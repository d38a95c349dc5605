//! # pbbes
//!
//! Operator console for the PATE bias board. The board is driven over a
//! serial line with short ASCII commands (`VERS?`, `MEASnn?`, `PWMnSxxx`,
//! `RRR`), each answered by `OK`, `ERROR` or a value line followed by `OK`.
//!
//! The console polls all measurements at a configurable interval, records
//! them to CSV, and lets the operator change the four PWM duty cycles and
//! the polling interval from the keyboard. A software [`emulator`] of the
//! board stands in for the hardware in tests and during development.

pub mod config;
pub mod connection;
pub mod console;
pub mod device;
pub mod display;
pub mod emulator;
pub mod error;
pub mod input;
pub mod keyboard;
pub mod protocol;
pub mod record;
pub mod scheduler;

pub use config::{Config, ConfigError};
pub use connection::Connection;
pub use console::{Console, Flow};
pub use device::Device;
pub use emulator::{BoardEmulator, CommandError, Loopback};
pub use error::{ConsoleError, TransactionError};
pub use keyboard::{Key, KeyDecoder, KeySource};
pub use scheduler::{IntervalScheduler, SystemClock};
