use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};
use serialport::prelude::*;
use std::cell::RefCell;
use std::io;
use std::thread;
use std::time::Duration;

// We're cheating here and will use the host OS's serial port as our UART,
// and for that we have to implement the read/write interfaces from
// embedded-hal.

pub struct SerialReader<'a>(pub &'a RefCell<Box<dyn SerialPort>>);
pub struct SerialWriter<'a>(pub &'a RefCell<Box<dyn SerialPort>>);
pub struct HostDelay;

impl Read<u8> for SerialReader<'_> {
    type Error = io::Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut buf: [u8; 1] = [0u8];
        match self.0.borrow_mut().read(&mut buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(_) => Ok(buf[0]),
            // The port is opened with a short read timeout; an empty poll
            // is not an error, it just means no byte has arrived yet.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(nb::Error::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }
}

impl Write<u8> for SerialWriter<'_> {
    type Error = io::Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        let buf: [u8; 1] = [word];
        match self.0.borrow_mut().write(&buf) {
            Ok(1) => Ok(()),
            Ok(_) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::from(e)),
        }
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        match self.0.borrow_mut().flush() {
            Ok(_) => Ok(()),
            Err(e) => Err(nb::Error::from(e)),
        }
    }
}

impl DelayMs<u16> for HostDelay {
    fn delay_ms(&mut self, ms: u16) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

pub fn prompt(text: &str) -> String {
    use std::io::Write as _;
    print!("{}", text);
    io::stdout().flush().unwrap();
    let mut line = String::new();
    io::stdin().read_line(&mut line).unwrap();
    line.trim().to_string()
}

#[allow(dead_code)]
// This allows us to share code between different PC-based demos.
// There's probably a better way to do it!
fn main() {}
