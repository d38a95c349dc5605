//! Measurement history and its CSV recording.
//!
//! Every measurement tick produces one [`Sample`]. A [`Recorder`] writes
//! samples as spreadsheet-friendly CSV: a short meta-header naming the
//! session, a column header, then one row per sample with the commands that
//! were issued since the previous row in the last column.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;

/// A displayed and recorded measurement.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Index into the `MEAS99?` field list.
    pub selector: usize,
    /// Two-line table heading.
    pub heading: (&'static str, &'static str),
    pub description: &'static str,
}

const fn column(
    selector: usize,
    name: &'static str,
    unit: &'static str,
    description: &'static str,
) -> Column {
    Column {
        selector,
        heading: (name, unit),
        description,
    }
}

/// Recorded columns, in display order.
pub const COLUMNS: [Column; 14] = [
    column(6, "I(t)", "mA", "Total bias generators supply current (mA)"),
    column(0, "T1D1", "V", "Bias voltage Tube 1 Detector 1 (V)"),
    column(1, "T1D2", "V", "Bias voltage Tube 1 Detector 2 (V)"),
    column(2, "T2D1", "V", "Bias voltage Tube 2 Detector 1 (V)"),
    column(3, "T2D2", "V", "Bias voltage Tube 2 Detector 2 (V)"),
    column(10, "T1D1", "mA", "Bias generator supply current Tube 1 Detector 1 (mA)"),
    column(11, "T1D2", "mA", "Bias generator supply current Tube 1 Detector 2 (mA)"),
    column(12, "T2D1", "mA", "Bias generator supply current Tube 2 Detector 1 (mA)"),
    column(13, "T2D2", "mA", "Bias generator supply current Tube 2 Detector 2 (mA)"),
    column(4, "FET1", "mV", "Radiation sensing MOSFET 1 drain voltage (mV)"),
    column(5, "FET2", "mV", "Radiation sensing MOSFET 2 drain voltage (mV)"),
    column(18, "Supp", "mV", "Analog Supply voltage (mV)"),
    column(14, "Supp", "'C", "Supply voltage converter temperature (C)"),
    column(16, "Bias", "'C", "Bias (high voltage) converter temperature (C)"),
];

/// Written in place of a value that could not be read.
pub const MISSING: &str = "ERR";

/// One measurement tick.
#[derive(Debug, Clone)]
pub struct Sample {
    pub time: DateTime<Local>,
    /// All fields of a `MEAS99?` reply, or `None` when the poll failed.
    pub values: Option<Vec<i32>>,
    /// State altering commands issued before this sample, comma separated.
    pub commands: String,
}

impl Sample {
    /// Value of a recorded column, if it was read.
    pub fn value(&self, column: &Column) -> Option<i32> {
        self.values.as_ref()?.get(column.selector).copied()
    }

    /// Whether commands were issued just before this sample was taken.
    pub fn follows_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    fn cells(&self) -> Vec<String> {
        let mut cells = Vec::with_capacity(COLUMNS.len() + 2);
        cells.push(self.time.format("%Y-%m-%d %H:%M:%S").to_string());
        cells.extend(COLUMNS.iter().map(|c| match self.value(c) {
            Some(v) => v.to_string(),
            None => String::from(MISSING),
        }));
        cells.push(self.commands.clone());
        cells
    }
}

/// File name of a recording started at `started`.
pub fn file_name(started: &DateTime<Local>) -> String {
    started.format("%Y-%m-%d %H.%M.%S.csv").to_string()
}

/// Writes samples as CSV.
pub struct Recorder<W: Write> {
    out: W,
    rows: usize,
}

impl Recorder<Box<dyn Write>> {
    /// Creates `dir/<start time>.csv` and writes its headers.
    pub fn create(
        dir: &Path,
        started: DateTime<Local>,
        label: &str,
        firmware: &str,
    ) -> io::Result<(Self, PathBuf)> {
        let path = dir.join(file_name(&started));
        let file = File::create(&path)?;
        debug!(path = %path.display(), "recording opened");
        let out: Box<dyn Write> = Box::new(BufWriter::new(file));
        let recorder = Recorder::new(out, started, label, firmware)?;
        Ok((recorder, path))
    }
}

impl<W: Write> Recorder<W> {
    /// Writes the meta-header and the column header to `out`.
    pub fn new(mut out: W, started: DateTime<Local>, label: &str, firmware: &str) -> io::Result<Self> {
        let started = started.format("%Y-%m-%d %H.%M.%S").to_string();
        write_record(&mut out, &["Started", &started])?;
        write_record(&mut out, &["Label", label])?;
        write_record(&mut out, &["Firmware", firmware])?;

        let mut header = vec!["Datetime"];
        header.extend(COLUMNS.iter().map(|c| c.description));
        header.push("Commands");
        write_record(&mut out, &header)?;
        out.flush()?;
        Ok(Self { out, rows: 0 })
    }

    /// Appends one sample and flushes, so a crash loses at most the row
    /// being written.
    pub fn write_sample(&mut self, sample: &Sample) -> io::Result<()> {
        let cells = sample.cells();
        let cells: Vec<&str> = cells.iter().map(String::as_str).collect();
        write_record(&mut self.out, &cells)?;
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Number of samples written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// One CSV record, quoted the way spreadsheets expect.
fn write_record<W: Write>(out: &mut W, fields: &[&str]) -> io::Result<()> {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.write_all(b",")?;
        }
        if field.contains([',', '"', '\r', '\n']) {
            write!(out, "\"{}\"", field.replace('"', "\"\""))?;
        } else {
            out.write_all(field.as_bytes())?;
        }
    }
    out.write_all(b"\r\n")
}
