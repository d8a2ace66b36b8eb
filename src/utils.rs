use arrayvec::{Array, ArrayString, ArrayVec};

/// Sink for the rendered bytes of an outbound command payload.
pub trait CommandWriter {
    fn write_cmd_bytes(&mut self, bytes: &[u8]);
}

/// Renders a command into its wire payload via a [`CommandWriter`].
pub trait ToPayload {
    fn to_payload(&self, writer: &mut dyn CommandWriter);
}

impl<A: Array<Item = u8>> CommandWriter for ArrayVec<A> {
    fn write_cmd_bytes(&mut self, bytes: &[u8]) {
        // Command payloads are a handful of ASCII bytes; the buffers used
        // here are sized well past the longest command.
        self.try_extend_from_slice(bytes).unwrap();
    }
}

/// Verbatim peer text carried inside error values. Fixed capacity; longer
/// payloads are truncated.
pub type Diagnostic = ArrayString<[u8; 96]>;

/// Copies `text` into a [`Diagnostic`], truncating if it does not fit.
pub(crate) fn diagnostic(text: &str) -> Diagnostic {
    let mut out = Diagnostic::new();
    for ch in text.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

/// Which half of the serial link an I/O failure occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// What kind of data-integrity violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    /// Reconstructed template length disagrees with the peer-reported count.
    LengthMismatch { reported: usize, actual: usize },
    /// A numeric field in a response did not parse.
    BadNumber,
    /// A template chunk was not valid hexadecimal (or had odd length).
    BadHex,
    /// More template data arrived than the buffer can hold.
    Overflow,
}

/// Errors produced by the driver and its session protocols.
///
/// Every variant aborts the current protocol and is returned to the caller;
/// nothing in this crate retries or reconnects on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying serial write/flush/read failed.
    Transport(Direction),
    /// No complete frame arrived within the timeout bound.
    Timeout,
    /// The peer answered, but not with the token the protocol step expected.
    Mismatch {
        expected: &'static str,
        got: Diagnostic,
    },
    /// The peer explicitly reported a failure; carried verbatim.
    PeerFailure(Diagnostic),
    /// The two enrollment captures did not match. Distinct from a generic
    /// model-creation failure.
    EnrollMismatch,
    /// No finger was on the sensor when a capture was requested.
    NoFinger,
    /// A chunked transfer or numeric field failed validation.
    DataIntegrity(IntegrityFault),
    /// The channel is not `Ready`, or the session already ended.
    NotReady,
    /// Enrollment slot ids must be in 1..=127.
    InvalidSlot(u8),
}

/// Writes `value` in decimal ASCII.
pub(crate) fn write_decimal(writer: &mut dyn CommandWriter, value: u16) {
    let mut digits = [0u8; 5];
    let mut n = value;
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    writer.write_cmd_bytes(&digits[i..]);
}

/// Decodes a hex string and appends the bytes to `dst`.
///
/// Strict: odd-length input or a non-hex digit is a [`IntegrityFault::BadHex`]
/// failure, and running out of buffer is [`IntegrityFault::Overflow`].
pub(crate) fn push_hex<A: Array<Item = u8>>(dst: &mut ArrayVec<A>, hex: &str) -> Result<(), Error> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(Error::DataIntegrity(IntegrityFault::BadHex));
    }
    let mut i = 0;
    while i < bytes.len() {
        let hi = hex_nibble(bytes[i])?;
        let lo = hex_nibble(bytes[i + 1])?;
        dst.try_push(hi << 4 | lo)
            .map_err(|_| Error::DataIntegrity(IntegrityFault::Overflow))?;
        i += 2;
    }
    Ok(())
}

fn hex_nibble(b: u8) -> Result<u8, Error> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::DataIntegrity(IntegrityFault::BadHex)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_decimal_renders_all_widths() {
        for &(value, expected) in &[(0u16, &b"0"[..]), (7, b"7"), (42, b"42"), (127, b"127")] {
            let mut buf = ArrayVec::<[u8; 16]>::new();
            write_decimal(&mut buf, value);
            assert_eq!(&buf[..], expected);
        }
    }

    #[test]
    fn diagnostic_truncates_long_text() {
        let mut long = ArrayString::<[u8; 128]>::new();
        for _ in 0..120 {
            long.push('x');
        }
        let d = diagnostic(&long);
        assert_eq!(d.len(), 96);
    }

    #[test]
    fn push_hex_decodes_mixed_case() {
        let mut buf = ArrayVec::<[u8; 8]>::new();
        push_hex(&mut buf, "aaBB01").unwrap();
        assert_eq!(&buf[..], &[0xAA, 0xBB, 0x01]);
    }

    #[test]
    fn push_hex_rejects_odd_length() {
        let mut buf = ArrayVec::<[u8; 8]>::new();
        assert_eq!(
            push_hex(&mut buf, "ABC"),
            Err(Error::DataIntegrity(IntegrityFault::BadHex))
        );
    }

    #[test]
    fn push_hex_rejects_non_hex_digit() {
        let mut buf = ArrayVec::<[u8; 8]>::new();
        assert_eq!(
            push_hex(&mut buf, "GG"),
            Err(Error::DataIntegrity(IntegrityFault::BadHex))
        );
    }

    #[test]
    fn push_hex_reports_overflow() {
        let mut buf = ArrayVec::<[u8; 2]>::new();
        assert_eq!(
            push_hex(&mut buf, "AABBCC"),
            Err(Error::DataIntegrity(IntegrityFault::Overflow))
        );
    }
}
