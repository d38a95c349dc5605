use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serialport::SerialPort;

use pbbes::emulator::{
    BoardEmulator, CALIBRATION_DOT_INTERVAL, CALIBRATION_PREAMBLE, EMULATOR_VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "pbb_emulator", version, about = "PATE bias board emulator, for developing pbbes")]
struct Cli {
    /// Serial port to listen on. Lists the available ports when omitted.
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,
}

// The main entry point for the emulator.
fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("=========================");
    println!("  {}  ", EMULATOR_VERSION);
    println!("=========================");

    let Some(port_name) = cli.port else {
        list_ports()?;
        return Ok(());
    };

    let mut port = serialport::new(&port_name, cli.baud)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("failed to open port '{}'", port_name))?;

    println!(
        "\nListening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, cli.baud
    );

    let mut board = BoardEmulator::new();
    serve(&mut board, port.as_mut())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("could not enumerate serial ports")?;
    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return Ok(());
    }
    println!("Available serial ports:");
    for port in ports {
        println!("  {}", port.port_name);
    }
    Ok(())
}

// Answers every complete command line until the port fails.
fn serve(board: &mut BoardEmulator, port: &mut dyn SerialPort) -> Result<()> {
    let mut serial_buf = [0u8; 128];
    let mut line = Vec::new();
    loop {
        let bytes_read = match port.read(&mut serial_buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e).context("serial port error"),
        };
        for &byte in &serial_buf[..bytes_read] {
            if byte != b'\n' {
                line.push(byte);
                continue;
            }
            let command = String::from_utf8_lossy(&line).trim().to_string();
            line.clear();
            if command.is_empty() {
                continue;
            }
            println!("> Received: {}", command);
            let reply = board.reply(&command);
            print!("< {}", reply);
            send(port, &reply).context("failed to write to serial port")?;
        }
    }
}

// During calibration the real board prints one progress dot every 500 ms
// while it discharges; the dots are paced the same way here.
fn send(port: &mut dyn SerialPort, reply: &str) -> io::Result<()> {
    let Some(progress) = reply.strip_prefix(CALIBRATION_PREAMBLE) else {
        port.write_all(reply.as_bytes())?;
        return port.flush();
    };
    port.write_all(CALIBRATION_PREAMBLE.as_bytes())?;
    port.flush()?;
    let result = progress.trim_start_matches('.');
    for _ in 0..progress.len() - result.len() {
        thread::sleep(CALIBRATION_DOT_INTERVAL);
        port.write_all(b".")?;
        port.flush()?;
    }
    port.write_all(result.as_bytes())?;
    port.flush()
}
