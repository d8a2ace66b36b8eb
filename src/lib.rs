//! **fpbridge** is an embedded-hal driver for fingerprint sensor modules that
//! sit behind a serial text-framing bridge - an MCU that owns the sensor and
//! relays commands and responses as `<...>` delimited ASCII frames.
//!
//! The crate covers the framing protocol and the four session protocols the
//! bridge firmware speaks: sensor initialization, enrollment (with optional
//! chunked template download), identification, and template count. The
//! transport itself - opening the port, baud setup, closing - stays with the
//! caller, who hands the driver a pair of `embedded-hal` serial halves and a
//! delay provider.
//!
//! ## Example
//!
//! To bring the sensor up and query it:
//! ```
//! # use embedded_hal::serial::{Read, Write};
//! # use embedded_hal::blocking::delay::DelayMs;
//! use fpbridge::{FpBridge, ChannelState};
//! # struct TestTx;
//! # struct TestRx { pos: usize, primed: bool }
//! # struct TestDelay;
//! #
//! # impl Write<u8> for TestTx {
//! #     type Error = ();
//! #     fn write(&mut self, _word: u8) -> nb::Result<(), Self::Error> {
//! #         Ok(())
//! #     }
//! #     fn flush(&mut self) -> nb::Result<(), Self::Error> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # const RES_DATA: &[u8] = b"<RESP:SENSOR_READY,CAP:200>\n<RESP:COUNT_RESULT:5>\n";
//! #
//! # impl Read<u8> for TestRx {
//! #     type Error = ();
//! #     fn read(&mut self) -> nb::Result<u8, Self::Error> {
//! #         if !self.primed {
//! #             self.primed = true;
//! #             return Err(nb::Error::WouldBlock);
//! #         }
//! #         if self.pos >= RES_DATA.len() {
//! #             return Err(nb::Error::WouldBlock);
//! #         }
//! #         let word = RES_DATA[self.pos];
//! #         self.pos += 1;
//! #         Ok(word)
//! #     }
//! # }
//! #
//! # impl DelayMs<u16> for TestDelay {
//! #     fn delay_ms(&mut self, _ms: u16) {}
//! # }
//! # let rx = TestRx { pos: 0, primed: false };
//! # let tx = TestTx;
//!
//! // Obtain tx, rx from some serial port implementation
//! let mut bridge = FpBridge::new(tx, rx, TestDelay);
//! bridge.initialize().unwrap();
//! assert_eq!(bridge.state(), ChannelState::Ready);
//! assert_eq!(bridge.capacity(), Some(200));
//! assert_eq!(bridge.template_count().unwrap(), 5);
//! ```
//!
//! For interactive flows (enrollment, identification), see the `demos`
//! directory: the session types yield control back to the caller whenever
//! the user has to place or lift a finger.
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![no_std]

mod commands;
mod driver;
mod framer;
mod responses;
mod utils;

pub use crate::commands::Command;
pub use crate::driver::{
    ChannelState, EnrollOptions, EnrollProgress, Enrollment, FpBridge, Identification,
    IdentifyOutcome, IdentifyProgress, CHUNK_TIMEOUT_MS, DOWNLOAD_ACK_TIMEOUT_MS, INIT_TIMEOUT_MS,
    RESPONSE_TIMEOUT_MS, SEARCH_TIMEOUT_MS, SETTLE_MS, TEMPLATE_CAPACITY,
};
pub use crate::framer::{Framer, END_MARKER, POLL_INTERVAL_MS, START_MARKER};
pub use crate::responses::{Ack, Message, Reply, MESSAGE_CAPACITY, RESPONSE_PREFIX};
pub use crate::utils::{Diagnostic, Direction, Error, IntegrityFault};
