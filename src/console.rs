//! The console's main loop, minus the drawing.
//!
//! [`Console`] owns everything the loop talks to and keeps the measurement
//! history the display shows. One [`Console::tick`] is one
//! scheduler wake-up.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};

use crate::connection::Connection;
use crate::device::Device;
use crate::error::{ConsoleError, TransactionError};
use crate::input::{InputRouter, ParameterField, Target};
use crate::keyboard::{Key, KeyDecoder, KeySource};
use crate::protocol::PWM_CHANNELS;
use crate::record::{Recorder, Sample};
use crate::scheduler::{Clock, IntervalScheduler, Source, SystemClock};

/// Samples kept for display.
pub const HISTORY: usize = 19;

/// What the caller should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console<C: Connection, K: KeySource, Clk: Clock = SystemClock> {
    device: Device<C>,
    scheduler: IntervalScheduler<Clk>,
    keys: KeyDecoder<K>,
    router: InputRouter<ParameterField>,
    samples: VecDeque<Sample>,
    recorder: Option<Recorder<Box<dyn Write>>>,
    status: String,
}

impl<C: Connection, K: KeySource, Clk: Clock> Console<C, K, Clk> {
    /// Reads the current PWM settings, takes the first sample and restarts
    /// the scheduler.
    pub fn new(
        mut device: Device<C>,
        scheduler: IntervalScheduler<Clk>,
        keys: KeyDecoder<K>,
    ) -> Result<Self, ConsoleError> {
        let mut router = InputRouter::new();
        for channel in PWM_CHANNELS {
            let value = device.pwm(channel)?;
            router.register(ParameterField::pwm(channel, value));
        }
        let seconds = scheduler.interval(Source::Measurement).as_secs();
        router.register(ParameterField::interval(u16::try_from(seconds).unwrap_or(u16::MAX)));

        let mut console = Self {
            device,
            scheduler,
            keys,
            router,
            samples: VecDeque::with_capacity(HISTORY),
            recorder: None,
            status: String::new(),
        };
        console.poll()?;
        console.scheduler.restart();
        Ok(console)
    }

    /// Records every following sample.
    pub fn with_recorder(mut self, recorder: Recorder<Box<dyn Write>>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Waits for the next scheduler event and handles it.
    pub fn tick(&mut self) -> Result<Flow, ConsoleError> {
        if self.scheduler.next().contains(Source::Measurement) {
            self.poll()?;
        }

        let keys: Vec<Key> = self.keys.keys().collect();
        for key in keys {
            if key == Key::Interrupt {
                info!("terminated by operator");
                return Ok(Flow::Quit);
            }
            self.router.dispatch(&key);
            self.apply_edits()?;
        }
        Ok(Flow::Continue)
    }

    /// Takes one sample. Any failed query still produces a row of `ERR`
    /// cells and the session goes on; only a recording failure is returned.
    pub fn poll(&mut self) -> Result<(), ConsoleError> {
        let values = match self.device.measure_all() {
            Ok(values) => Some(values),
            Err(e) => {
                error!(error = %e, "MEAS99? query failure");
                self.status = format!("Measurement failed: {}", e);
                None
            }
        };
        let sample = Sample {
            time: Local::now(),
            values,
            commands: self.device.drain_commands(),
        };
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.write_sample(&sample).map_err(ConsoleError::Record)?;
        }
        if self.samples.len() == HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    fn apply_edits(&mut self) -> Result<(), TransactionError> {
        for field in self.router.consumers_mut() {
            let Some(value) = field.take_submitted() else {
                continue;
            };
            match field.target {
                Target::Pwm(channel) => match self.device.set_pwm(channel, value) {
                    Ok(applied) => {
                        info!(channel, value = applied, "PWM set");
                        field.value = applied;
                        self.status = format!("PWM{} set to {}", channel, applied);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(channel, value, error = %e, "PWM not set");
                        self.status = format!("PWM{} not set: {}", channel, e);
                    }
                },
                Target::Interval => {
                    let interval = Duration::from_secs(u64::from(value));
                    self.scheduler.set_interval(Source::Measurement, interval);
                    field.value = value;
                    self.status = format!("Interval set to {} s", value);
                }
            }
        }
        Ok(())
    }

    /// Oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn fields(&self) -> &[ParameterField] {
        self.router.consumers()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn device(&self) -> &Device<C> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<C> {
        &mut self.device
    }

    pub fn scheduler(&self) -> &IntervalScheduler<Clk> {
        &self.scheduler
    }

    pub fn keys_mut(&mut self) -> &mut KeyDecoder<K> {
        &mut self.keys
    }
}
