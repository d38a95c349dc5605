//! Wire vocabulary of the bias board: command lines and value decoding.

use std::fmt;

use crate::error::TransactionError;

/// Selector that returns every measurement field on one line.
pub const ALL_FIELDS: u8 = 99;

/// Number of integer fields in an [`ALL_FIELDS`] reply.
pub const FIELD_COUNT: usize = 19;

/// PWM channels are numbered 1..=4.
pub const PWM_CHANNELS: std::ops::RangeInclusive<u8> = 1..=4;

/// Largest value a PWM channel accepts.
pub const PWM_MAX: u16 = 999;

/// Every command the board understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Measure(u8),
    PwmQuery(u8),
    PwmSet(u8, u16),
    Calibrate,
}

/// Formats the command without its line terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "VERS?"),
            Command::Measure(selector) => write!(f, "MEAS{:02}?", selector),
            Command::PwmQuery(channel) => write!(f, "PWM{}?", channel),
            Command::PwmSet(channel, value) => write!(f, "PWM{}S{:03}", channel, value),
            Command::Calibrate => write!(f, "RRR"),
        }
    }
}

/// A decoded measurement reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    Value(i32),
    Fields(Vec<i32>),
    /// Selector without a known decoding; carries an `n=NN` marker.
    Unhandled(String),
}

/// How many leading characters of the value line hold the number for a
/// single-field selector, or `None` when the selector is unknown.
pub fn selector_width(selector: u8) -> Option<usize> {
    match selector {
        0..=3 => Some(3),
        4 | 5 | 18 => Some(4),
        6 | 10..=17 => Some(2),
        _ => None,
    }
}

/// Decodes the whitespace separated value line of an [`ALL_FIELDS`] reply.
pub fn decode_fields(value: &str) -> Result<Vec<i32>, TransactionError> {
    value
        .split_whitespace()
        .map(|field| parse_int(field, value))
        .collect()
}

/// Decodes the value line of a `MEASnn?` reply.
pub fn decode_reading(selector: u8, value: &str) -> Result<Reading, TransactionError> {
    if selector == ALL_FIELDS {
        return decode_fields(value).map(Reading::Fields);
    }
    match selector_width(selector) {
        Some(width) => {
            let head: String = value.chars().take(width).collect();
            parse_int(&head, value).map(Reading::Value)
        }
        None => {
            tracing::error!(selector, "unhandled measurement selector");
            Ok(Reading::Unhandled(format!("n={:02}", selector)))
        }
    }
}

fn parse_int(text: &str, whole: &str) -> Result<i32, TransactionError> {
    text.trim()
        .parse::<i32>()
        .map_err(|_| TransactionError::InvalidValue {
            value: whole.to_string(),
        })
}
