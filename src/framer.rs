use arrayvec::ArrayString;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::Read;

use crate::responses::{Message, MESSAGE_CAPACITY};
use crate::utils::{Direction, Error};

/// Byte that opens a frame on the wire.
pub const START_MARKER: u8 = b'<';
/// Byte that closes a frame on the wire.
pub const END_MARKER: u8 = b'>';

/// Idle wait between unsuccessful polls of the serial line, in milliseconds.
/// A scheduling detail: the timeout is accounted in these intervals.
pub const POLL_INTERVAL_MS: u16 = 5;

/// Assembles delimited frames out of a live, arbitrarily-chunked byte stream.
///
/// Holds the in-progress payload between `receive` calls, so a frame split
/// across calls is still assembled. A start marker always resets the
/// accumulator: a frame whose end marker never arrived is discarded, never
/// spliced onto the next one.
///
/// Not reentrant - one outstanding `receive` per channel, which the `&mut`
/// receivers enforce.
#[derive(Debug)]
pub struct Framer {
    payload: ArrayString<[u8; MESSAGE_CAPACITY]>,
    frame_open: bool,
}

impl Framer {
    pub fn new() -> Self {
        Framer {
            payload: ArrayString::new(),
            frame_open: false,
        }
    }

    /// Drops any buffered partial frame.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.frame_open = false;
    }

    /// Reads bytes until a complete frame is assembled or `timeout_ms`
    /// elapses, yielding the decoded [`Message`].
    ///
    /// Timeout accounting is approximate: each idle poll is charged one
    /// [`POLL_INTERVAL_MS`], and each received byte is charged one
    /// millisecond (about a byte's line time at 9600 baud) so a peer
    /// streaming garbage without an end marker cannot stall the call
    /// forever.
    pub fn receive<RX, D>(
        &mut self,
        rx: &mut RX,
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<Message, Error>
    where
        RX: Read<u8>,
        D: DelayMs<u16>,
    {
        let mut elapsed_ms: u32 = 0;
        loop {
            match rx.read() {
                Ok(byte) => {
                    if let Some(msg) = self.accept(byte) {
                        return Ok(msg);
                    }
                    elapsed_ms = elapsed_ms.saturating_add(1);
                }
                Err(nb::Error::WouldBlock) => {
                    delay.delay_ms(POLL_INTERVAL_MS);
                    elapsed_ms = elapsed_ms.saturating_add(u32::from(POLL_INTERVAL_MS));
                }
                Err(nb::Error::Other(_)) => {
                    return Err(Error::Transport(Direction::Receive));
                }
            }
            if elapsed_ms >= timeout_ms {
                return Err(Error::Timeout);
            }
        }
    }

    /// Feeds one byte into the assembler; returns a message when `byte`
    /// completes a frame.
    fn accept(&mut self, byte: u8) -> Option<Message> {
        if byte == START_MARKER {
            // A new start marker discards whatever partial frame came before.
            self.payload.clear();
            self.frame_open = true;
            return None;
        }

        if !self.frame_open {
            // Noise between frames.
            return None;
        }

        if byte == END_MARKER {
            self.frame_open = false;
            let msg = Message::from_payload(&self.payload);
            self.payload.clear();
            return Some(msg);
        }

        // Best-effort decode: only printable ASCII enters the payload,
        // anything else is dropped without failing the frame.
        if (0x20..=0x7E).contains(&byte) {
            if self.payload.try_push(byte as char).is_err() {
                // Payload overran the frame capacity; treat the frame as
                // lost and wait for the next start marker.
                self.clear();
            }
        }
        None
    }
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}
