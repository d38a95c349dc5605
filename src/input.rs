//! Routing of key presses to the widgets that accept input.
//!
//! The console mostly displays data, but a few parameters can be edited.
//! The operator presses a trigger key (F1..F4, F9) to start editing one of
//! them; from then on that consumer receives every key until it reports that
//! the edit is over. While no consumer is active each key is offered to all
//! of them in registration order, and the first one that activates keeps it.

use tracing::debug;

use crate::keyboard::Key;

/// Something that accepts key presses.
pub trait InputConsumer {
    /// Handles one key and returns whether this consumer is now active,
    /// i.e. wants to receive all following keys exclusively.
    fn process_input(&mut self, key: &Key) -> bool;
}

/// Lets one router hold consumers of different types as
/// `InputRouter<Box<dyn InputConsumer>>`.
impl<T: InputConsumer + ?Sized> InputConsumer for Box<T> {
    fn process_input(&mut self, key: &Key) -> bool {
        (**self).process_input(key)
    }
}

/// Dispatches keys to at most one active consumer at a time.
pub struct InputRouter<C: InputConsumer> {
    consumers: Vec<C>,
    active: Option<usize>,
}

impl<C: InputConsumer> InputRouter<C> {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
            active: None,
        }
    }

    pub fn register(&mut self, consumer: C) {
        self.consumers.push(consumer);
    }

    /// Index of the active consumer, if any.
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn consumers(&self) -> &[C] {
        &self.consumers
    }

    pub fn consumers_mut(&mut self) -> &mut [C] {
        &mut self.consumers
    }

    pub fn dispatch(&mut self, key: &Key) {
        match self.active {
            Some(index) => {
                if !self.consumers[index].process_input(key) {
                    debug!(index, "input consumer released");
                    self.active = None;
                }
            }
            None => {
                self.active = self
                    .consumers
                    .iter_mut()
                    .position(|consumer| consumer.process_input(key));
                if let Some(index) = self.active {
                    debug!(index, %key, "input consumer activated");
                }
            }
        }
    }
}

impl<C: InputConsumer> Default for InputRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a [`ParameterField`] edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// PWM channel 1..=4.
    Pwm(u8),
    /// Measurement interval in seconds.
    Interval,
}

/// An editable numeric parameter with a three digit entry buffer.
#[derive(Debug, Clone)]
pub struct ParameterField {
    pub target: Target,
    pub trigger: Key,
    /// Last value confirmed by the board or scheduler.
    pub value: u16,
    minimum: u16,
    buffer: String,
    active: bool,
    submitted: Option<u16>,
}

const MAX_DIGITS: usize = 3;

impl ParameterField {
    /// PWM channel `n`, triggered by `F<n>`.
    pub fn pwm(channel: u8, value: u16) -> Self {
        Self::new(Target::Pwm(channel), Key::F(channel), value, 0)
    }

    /// Measurement interval, triggered by F9. Zero is not accepted.
    pub fn interval(seconds: u16) -> Self {
        Self::new(Target::Interval, Key::F(9), seconds, 1)
    }

    fn new(target: Target, trigger: Key, value: u16, minimum: u16) -> Self {
        Self {
            target,
            trigger,
            value,
            minimum,
            buffer: String::new(),
            active: false,
            submitted: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Digits typed so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The value entered with ENTER, if it has not been collected yet.
    pub fn take_submitted(&mut self) -> Option<u16> {
        self.submitted.take()
    }

    pub fn label(&self) -> String {
        match self.target {
            Target::Pwm(channel) => format!("PWM{}", channel),
            Target::Interval => String::from("Interval"),
        }
    }

    fn cancel(&mut self) {
        self.buffer.clear();
        self.active = false;
    }

    fn submit(&mut self) {
        match self.buffer.parse::<u16>() {
            Ok(v) if v >= self.minimum => self.submitted = Some(v),
            Ok(v) => debug!(param = ?self.target, value = v, "below minimum, not set"),
            Err(_) => debug!(param = ?self.target, "buffer was empty, value not set"),
        }
        self.cancel();
    }
}

impl InputConsumer for ParameterField {
    fn process_input(&mut self, key: &Key) -> bool {
        if !self.active {
            self.active = *key == self.trigger;
            return self.active;
        }
        match key {
            k if *k == self.trigger => self.cancel(),
            Key::Esc => self.cancel(),
            Key::Delete | Key::Backspace => {
                self.buffer.pop();
            }
            Key::Enter => self.submit(),
            Key::Char(c) if c.is_ascii_digit() && self.buffer.len() < MAX_DIGITS => {
                self.buffer.push(*c)
            }
            other => debug!(param = ?self.target, key = %other, "key ignored"),
        }
        self.active
    }
}
