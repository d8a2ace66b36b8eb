use arrayvec::ArrayVec;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};
use nb::block;

use crate::commands::Command;
use crate::framer::{Framer, END_MARKER, START_MARKER};
use crate::responses::{Ack, Message, Reply};
use crate::utils::{diagnostic, push_hex, Diagnostic, Direction, Error, IntegrityFault, ToPayload};

/// Settle time after the transport opens, while the bridge board resets.
pub const SETTLE_MS: u16 = 2500;
/// How long sensor initialization may take on the bridge side.
pub const INIT_TIMEOUT_MS: u32 = 10_000;
/// Default bound for any single response.
pub const RESPONSE_TIMEOUT_MS: u32 = 15_000;
/// Bound for the final identification search, which runs on the module.
pub const SEARCH_TIMEOUT_MS: u32 = 10_000;
/// Bound for the template download acknowledgment.
pub const DOWNLOAD_ACK_TIMEOUT_MS: u32 = 5_000;
/// Bound for each template chunk or the completion message.
pub const CHUNK_TIMEOUT_MS: u32 = 10_000;

/// Upper bound on a reconstructed template, in bytes.
pub const TEMPLATE_CAPACITY: usize = 2048;

type TemplateBuffer = ArrayVec<[u8; TEMPLATE_CAPACITY]>;
type CmdBuffer = ArrayVec<[u8; 128]>;

/// Lifecycle of the serial channel to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

/// Represents a fingerprint sensor reached through a serial text-framing
/// bridge (an MCU that owns the sensor and relays `<...>` framed commands).
///
/// The bridge owns the transport halves for its entire lifetime; use
/// [`FpBridge::release`] to get them back. The protocol is half-duplex in
/// logical terms - one outstanding request at a time, responses matched to
/// commands purely by position - so everything here is `&mut self` and
/// strictly sequential.
#[derive(Debug)]
pub struct FpBridge<TX, RX, D> {
    tx: TX,
    rx: RX,
    delay: D,
    framer: Framer,
    cmd_buffer: CmdBuffer,
    state: ChannelState,
    capacity: Option<u16>,
}

impl<TX, RX, D> FpBridge<TX, RX, D>
where
    TX: Write<u8>,
    RX: Read<u8>,
    D: DelayMs<u16>,
{
    /// Wraps an already-open transport. The channel starts `Disconnected`;
    /// call [`FpBridge::initialize`] before any session.
    pub fn new(tx: TX, rx: RX, delay: D) -> Self {
        Self {
            tx,
            rx,
            delay,
            framer: Framer::new(),
            cmd_buffer: CmdBuffer::new(),
            state: ChannelState::Disconnected,
            capacity: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Sensor capacity reported during the init handshake, if the bridge
    /// included one and it parsed.
    pub fn capacity(&self) -> Option<u16> {
        self.capacity
    }

    /// Runs the sensor-init handshake.
    ///
    /// Waits out the bridge's reset time, drains any buffered bytes, sends
    /// `INIT_SENSOR` and waits for `SENSOR_READY` (with an optional
    /// best-effort `,CAP:<n>` capacity field). Failure of any kind leaves
    /// the channel `Failed`; no retry is attempted here - reconnection
    /// policy belongs to the caller, who may simply call this again.
    pub fn initialize(&mut self) -> Result<(), Error> {
        match self.state {
            ChannelState::Disconnected | ChannelState::Failed => {}
            // Already connecting or ready: reset first.
            _ => return Err(Error::NotReady),
        }
        self.state = ChannelState::Connecting;
        self.capacity = None;

        self.delay.delay_ms(SETTLE_MS);
        self.drain();
        self.framer.clear();

        if let Err(e) = self.send_command(Command::InitSensor) {
            self.state = ChannelState::Failed;
            return Err(e);
        }

        let msg = match self.receive(INIT_TIMEOUT_MS) {
            Ok(msg) => msg,
            Err(e) => {
                self.state = ChannelState::Failed;
                return Err(e);
            }
        };

        match msg.reply() {
            Reply::SensorReady { capacity } => {
                self.capacity = capacity;
                self.state = ChannelState::Ready;
                Ok(())
            }
            Reply::SensorError | Reply::Fail(_) => {
                self.state = ChannelState::Failed;
                Err(Error::PeerFailure(diagnostic(msg.as_str())))
            }
            _ => {
                self.state = ChannelState::Failed;
                Err(Error::Mismatch {
                    expected: "SENSOR_READY",
                    got: diagnostic(msg.as_str()),
                })
            }
        }
    }

    /// Forces the channel back to `Disconnected`.
    ///
    /// Required after abandoning a session mid-protocol: there is no resync
    /// handshake, so the only safe recovery is to reset and initialize
    /// again (reopening the transport as needed).
    pub fn reset(&mut self) {
        self.state = ChannelState::Disconnected;
        self.capacity = None;
        self.framer.clear();
    }

    /// Gives the transport halves back to the caller, which owns opening
    /// and closing them.
    pub fn release(self) -> (TX, RX, D) {
        (self.tx, self.rx, self.delay)
    }

    /// Asks the sensor how many templates it stores.
    pub fn template_count(&mut self) -> Result<u16, Error> {
        self.ensure_ready()?;
        self.send_command(Command::Count)?;
        let msg = self.receive(RESPONSE_TIMEOUT_MS)?;
        match msg.reply() {
            Reply::CountResult(Some(n)) => Ok(n),
            Reply::CountResult(None) => Err(Error::DataIntegrity(IntegrityFault::BadNumber)),
            Reply::Fail(text) => Err(Error::PeerFailure(diagnostic(text))),
            _ => Err(Error::Mismatch {
                expected: "COUNT_RESULT",
                got: diagnostic(msg.as_str()),
            }),
        }
    }

    /// Frames `cmd` as `<PAYLOAD>\n`, writes it and flushes. No retry;
    /// retry policy belongs to the caller.
    pub fn send_command(&mut self, cmd: Command) -> Result<(), Error> {
        self.cmd_buffer.clear();
        self.cmd_buffer.push(START_MARKER);
        cmd.to_payload(&mut self.cmd_buffer);
        self.cmd_buffer.push(END_MARKER);
        self.cmd_buffer.push(b'\n');

        let cmd_bytes = &self.cmd_buffer[..];
        for byte in cmd_bytes {
            block!(self.tx.write(*byte)).map_err(|_| Error::Transport(Direction::Send))?;
        }
        block!(self.tx.flush()).map_err(|_| Error::Transport(Direction::Send))?;
        Ok(())
    }

    pub(crate) fn receive(&mut self, timeout_ms: u32) -> Result<Message, Error> {
        self.framer.receive(&mut self.rx, &mut self.delay, timeout_ms)
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), Error> {
        if self.state == ChannelState::Ready {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Best-effort flush of stale input left over from before the handshake.
    fn drain(&mut self) {
        while self.rx.read().is_ok() {}
    }
}

/// What the caller should do next after an enrollment step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollProgress {
    /// Ask the user to place their finger, then call `step` again.
    PlaceFinger,
    /// Ask the user to lift their finger, then call `step` again.
    RemoveFinger,
    /// Ask the user to place the same finger again, then call `step` again.
    PlaceSameFinger,
    /// The protocol advanced; call `step` again.
    Working,
    /// The template download finished and validated; the bytes are
    /// available via [`Enrollment::template`]. Call `step` again.
    TemplateReady,
    /// Enrollment finished.
    Done,
}

/// Optional tail steps of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollOptions {
    /// Download the created template to the host before storing.
    pub download_template: bool,
    /// Store the created model in the sensor's flash.
    pub store_in_module: bool,
}

impl Default for EnrollOptions {
    fn default() -> Self {
        EnrollOptions {
            download_template: false,
            store_in_module: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrollState {
    Start,
    FirstPlacement,
    FirstConvert,
    RemovePrompt,
    Removal,
    SecondPrompt,
    SecondPlacement,
    SecondConvert,
    CreateModel,
    RequestDownload,
    Downloading,
    Store,
    Finished,
    Failed,
}

/// The enrollment session protocol, driven one step at a time.
///
/// Each [`Enrollment::step`] call performs one send/expect exchange and
/// returns an [`EnrollProgress`] telling the caller whether the human needs
/// to act before the next call. The first unexpected response aborts the
/// session; no command after the failing step is ever sent, and a failed
/// session cannot be stepped again. Abandoning a session mid-way requires
/// [`FpBridge::reset`] before anything else uses the channel.
#[derive(Debug)]
pub struct Enrollment {
    slot: u8,
    options: EnrollOptions,
    state: EnrollState,
    template: TemplateBuffer,
    skipped: u16,
}

impl Enrollment {
    /// Starts a session for the given flash slot (1-127).
    pub fn new(slot: u8, options: EnrollOptions) -> Result<Self, Error> {
        if slot == 0 || slot > 127 {
            return Err(Error::InvalidSlot(slot));
        }
        Ok(Enrollment {
            slot,
            options,
            state: EnrollState::Start,
            template: TemplateBuffer::new(),
            skipped: 0,
        })
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// The downloaded template bytes, once [`EnrollProgress::TemplateReady`]
    /// has been returned. Hand these, with [`Enrollment::slot`], to whatever
    /// stores templates on the host.
    pub fn template(&self) -> Option<&[u8]> {
        if self.template.is_empty() {
            None
        } else {
            Some(&self.template)
        }
    }

    /// How many unrecognized messages were skipped while waiting for
    /// template chunks.
    pub fn skipped_messages(&self) -> u16 {
        self.skipped
    }

    /// Advances the protocol by one exchange.
    pub fn step<TX, RX, D>(&mut self, link: &mut FpBridge<TX, RX, D>) -> Result<EnrollProgress, Error>
    where
        TX: Write<u8>,
        RX: Read<u8>,
        D: DelayMs<u16>,
    {
        link.ensure_ready()?;
        if self.state == EnrollState::Failed {
            return Err(Error::NotReady);
        }
        match self.advance(link) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = EnrollState::Failed;
                Err(e)
            }
        }
    }

    fn advance<TX, RX, D>(&mut self, link: &mut FpBridge<TX, RX, D>) -> Result<EnrollProgress, Error>
    where
        TX: Write<u8>,
        RX: Read<u8>,
        D: DelayMs<u16>,
    {
        match self.state {
            EnrollState::Start => {
                link.send_command(Command::Enroll { slot: self.slot })?;
                expect(link, "ASK_PLACE_FINGER", |r| *r == Reply::AskPlaceFinger)?;
                self.state = EnrollState::FirstPlacement;
                Ok(EnrollProgress::PlaceFinger)
            }

            EnrollState::FirstPlacement => {
                link.send_command(Command::GetImage)?;
                expect_capture(link, "OK:IMAGE1_TAKEN", Ack::Image1Taken)?;
                self.state = EnrollState::FirstConvert;
                Ok(EnrollProgress::Working)
            }

            EnrollState::FirstConvert => {
                link.send_command(Command::ImageToTz1)?;
                expect(link, "OK:CONVERT1_DONE", |r| {
                    *r == Reply::Ok(Ack::Convert1Done)
                })?;
                self.state = EnrollState::RemovePrompt;
                Ok(EnrollProgress::Working)
            }

            // The bridge sends ASK_REMOVE_FINGER unsolicited.
            EnrollState::RemovePrompt => {
                expect(link, "ASK_REMOVE_FINGER", |r| *r == Reply::AskRemoveFinger)?;
                self.state = EnrollState::Removal;
                Ok(EnrollProgress::RemoveFinger)
            }

            EnrollState::Removal => {
                link.send_command(Command::RemoveFingerAck)?;
                expect(link, "FINGER_REMOVED", |r| *r == Reply::FingerRemoved)?;
                self.state = EnrollState::SecondPrompt;
                Ok(EnrollProgress::Working)
            }

            // ASK_PLACE_AGAIN is also unsolicited.
            EnrollState::SecondPrompt => {
                expect(link, "ASK_PLACE_AGAIN", |r| *r == Reply::AskPlaceAgain)?;
                self.state = EnrollState::SecondPlacement;
                Ok(EnrollProgress::PlaceSameFinger)
            }

            EnrollState::SecondPlacement => {
                link.send_command(Command::GetImage)?;
                expect_capture(link, "OK:IMAGE2_TAKEN", Ack::Image2Taken)?;
                self.state = EnrollState::SecondConvert;
                Ok(EnrollProgress::Working)
            }

            EnrollState::SecondConvert => {
                link.send_command(Command::ImageToTz2)?;
                expect(link, "OK:CONVERT2_DONE", |r| {
                    *r == Reply::Ok(Ack::Convert2Done)
                })?;
                self.state = EnrollState::CreateModel;
                Ok(EnrollProgress::Working)
            }

            EnrollState::CreateModel => {
                link.send_command(Command::CreateModel)?;
                let msg = link.receive(RESPONSE_TIMEOUT_MS)?;
                match msg.reply() {
                    Reply::Ok(Ack::ModelCreated) => {}
                    Reply::EnrollMismatch => return Err(Error::EnrollMismatch),
                    Reply::Fail(text) => return Err(Error::PeerFailure(diagnostic(text))),
                    _ => {
                        return Err(Error::Mismatch {
                            expected: "OK:MODEL_CREATED",
                            got: diagnostic(msg.as_str()),
                        })
                    }
                }
                self.continue_after_model()
            }

            EnrollState::RequestDownload => {
                link.send_command(Command::DownloadTemplate)?;
                let msg = link.receive(DOWNLOAD_ACK_TIMEOUT_MS)?;
                match msg.reply() {
                    Reply::Ok(Ack::TemplateUploadAcknowledged) => {}
                    Reply::Fail(text) => return Err(Error::PeerFailure(diagnostic(text))),
                    _ => {
                        return Err(Error::Mismatch {
                            expected: "OK:TEMPLATE_UPLOAD_CMD_ACKNOWLEDGED",
                            got: diagnostic(msg.as_str()),
                        })
                    }
                }
                self.state = EnrollState::Downloading;
                Ok(EnrollProgress::Working)
            }

            // Chunk reassembly loop. Bounded only by the per-message
            // timeout: a peer that keeps sending unrecognized messages can
            // stall this step indefinitely. Accepted risk, inherited from
            // the protocol itself, which has no overall transfer deadline.
            EnrollState::Downloading => loop {
                let msg = link.receive(CHUNK_TIMEOUT_MS)?;
                match msg.reply() {
                    Reply::TemplateChunk(hex) => {
                        push_hex(&mut self.template, hex)?;
                    }
                    Reply::Ok(Ack::TemplateDownloadComplete(reported)) => {
                        let reported =
                            reported.ok_or(Error::DataIntegrity(IntegrityFault::BadNumber))?;
                        if self.template.len() != reported {
                            return Err(Error::DataIntegrity(IntegrityFault::LengthMismatch {
                                reported,
                                actual: self.template.len(),
                            }));
                        }
                        self.state = if self.options.store_in_module {
                            EnrollState::Store
                        } else {
                            EnrollState::Finished
                        };
                        return Ok(EnrollProgress::TemplateReady);
                    }
                    Reply::Fail(text) => return Err(Error::PeerFailure(diagnostic(text))),
                    _ => {
                        // Reported via skipped_messages(); keep waiting.
                        self.skipped = self.skipped.saturating_add(1);
                    }
                }
            },

            EnrollState::Store => {
                link.send_command(Command::StoreModel)?;
                let msg = link.receive(RESPONSE_TIMEOUT_MS)?;
                match msg.reply() {
                    // The stored id must be exactly the enrolled slot.
                    Reply::Ok(Ack::Stored(Some(id))) if id == self.slot => {}
                    Reply::Fail(text) => return Err(Error::PeerFailure(diagnostic(text))),
                    _ => {
                        return Err(Error::Mismatch {
                            expected: "OK:STORED:<slot>",
                            got: diagnostic(msg.as_str()),
                        })
                    }
                }
                self.state = EnrollState::Finished;
                Ok(EnrollProgress::Done)
            }

            EnrollState::Finished => Ok(EnrollProgress::Done),

            EnrollState::Failed => Err(Error::NotReady),
        }
    }

    fn continue_after_model(&mut self) -> Result<EnrollProgress, Error> {
        if self.options.download_template {
            self.state = EnrollState::RequestDownload;
            Ok(EnrollProgress::Working)
        } else if self.options.store_in_module {
            self.state = EnrollState::Store;
            Ok(EnrollProgress::Working)
        } else {
            self.state = EnrollState::Finished;
            Ok(EnrollProgress::Done)
        }
    }
}

/// What the caller should do next after an identification step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyProgress {
    /// Ask the user to place their finger, then call `step` again.
    PlaceFinger,
    /// The protocol advanced; call `step` again.
    Working,
    /// The search finished.
    Done(IdentifyOutcome),
}

/// Terminal classification of an identification search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// A template matched.
    Match { slot: u16, confidence: u16 },
    /// The peer claimed a match but a numeric field did not parse; the
    /// verbatim reply is preserved. Diagnostic, not fatal.
    MatchGarbled(Diagnostic),
    /// No stored template matched.
    NoMatch,
    /// A reply outside the search vocabulary, verbatim.
    Unrecognized(Diagnostic),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentifyState {
    Start,
    Placement,
    Convert,
    Search,
    Finished,
    Failed,
}

/// The identification session protocol, driven one step at a time, in the
/// same shape as [`Enrollment`].
#[derive(Debug)]
pub struct Identification {
    state: IdentifyState,
    outcome: Option<IdentifyOutcome>,
}

impl Identification {
    pub fn new() -> Self {
        Identification {
            state: IdentifyState::Start,
            outcome: None,
        }
    }

    /// Advances the protocol by one exchange.
    pub fn step<TX, RX, D>(
        &mut self,
        link: &mut FpBridge<TX, RX, D>,
    ) -> Result<IdentifyProgress, Error>
    where
        TX: Write<u8>,
        RX: Read<u8>,
        D: DelayMs<u16>,
    {
        link.ensure_ready()?;
        if self.state == IdentifyState::Failed {
            return Err(Error::NotReady);
        }
        match self.advance(link) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = IdentifyState::Failed;
                Err(e)
            }
        }
    }

    fn advance<TX, RX, D>(
        &mut self,
        link: &mut FpBridge<TX, RX, D>,
    ) -> Result<IdentifyProgress, Error>
    where
        TX: Write<u8>,
        RX: Read<u8>,
        D: DelayMs<u16>,
    {
        match self.state {
            IdentifyState::Start => {
                link.send_command(Command::Identify)?;
                expect(link, "ASK_PLACE_FINGER", |r| *r == Reply::AskPlaceFinger)?;
                self.state = IdentifyState::Placement;
                Ok(IdentifyProgress::PlaceFinger)
            }

            IdentifyState::Placement => {
                link.send_command(Command::GetImage)?;
                expect_capture(link, "OK:IMAGE_TAKEN", Ack::ImageTaken)?;
                self.state = IdentifyState::Convert;
                Ok(IdentifyProgress::Working)
            }

            IdentifyState::Convert => {
                link.send_command(Command::ImageToTz1)?;
                expect(link, "OK:CONVERT_DONE", |r| *r == Reply::Ok(Ack::ConvertDone))?;
                self.state = IdentifyState::Search;
                Ok(IdentifyProgress::Working)
            }

            // The bridge runs the search on its own and pushes the result;
            // the search can be slow on the module side, hence the longer
            // bound.
            IdentifyState::Search => {
                let msg = link.receive(SEARCH_TIMEOUT_MS)?;
                let outcome = match msg.reply() {
                    Reply::IdFound {
                        slot: Some(slot),
                        confidence: Some(confidence),
                    } => IdentifyOutcome::Match { slot, confidence },
                    Reply::IdFound { .. } => {
                        IdentifyOutcome::MatchGarbled(diagnostic(msg.as_str()))
                    }
                    Reply::NotFound => IdentifyOutcome::NoMatch,
                    Reply::Fail(text) => return Err(Error::PeerFailure(diagnostic(text))),
                    _ => IdentifyOutcome::Unrecognized(diagnostic(msg.as_str())),
                };
                self.state = IdentifyState::Finished;
                self.outcome = Some(outcome.clone());
                Ok(IdentifyProgress::Done(outcome))
            }

            IdentifyState::Finished => match &self.outcome {
                Some(outcome) => Ok(IdentifyProgress::Done(outcome.clone())),
                None => Err(Error::NotReady),
            },

            IdentifyState::Failed => Err(Error::NotReady),
        }
    }
}

impl Default for Identification {
    fn default() -> Self {
        Identification::new()
    }
}

/// Receives one message and checks it against `accept`. A peer-reported
/// failure comes back verbatim as [`Error::PeerFailure`]; anything else
/// unexpected is an [`Error::Mismatch`] against `expected`.
fn expect<TX, RX, D, F>(
    link: &mut FpBridge<TX, RX, D>,
    expected: &'static str,
    accept: F,
) -> Result<(), Error>
where
    TX: Write<u8>,
    RX: Read<u8>,
    D: DelayMs<u16>,
    F: Fn(&Reply<'_>) -> bool,
{
    let msg = link.receive(RESPONSE_TIMEOUT_MS)?;
    let reply = msg.reply();
    if accept(&reply) {
        return Ok(());
    }
    match reply {
        Reply::Fail(text) => Err(Error::PeerFailure(diagnostic(text))),
        _ => Err(Error::Mismatch {
            expected,
            got: diagnostic(msg.as_str()),
        }),
    }
}

/// Like [`expect`] for image captures, where `NO_FINGER` is a distinguished
/// failure rather than a generic mismatch.
fn expect_capture<TX, RX, D>(
    link: &mut FpBridge<TX, RX, D>,
    expected: &'static str,
    ack: Ack<'static>,
) -> Result<(), Error>
where
    TX: Write<u8>,
    RX: Read<u8>,
    D: DelayMs<u16>,
{
    let msg = link.receive(RESPONSE_TIMEOUT_MS)?;
    match msg.reply() {
        reply if reply == Reply::Ok(ack) => Ok(()),
        Reply::NoFinger => Err(Error::NoFinger),
        Reply::Fail(text) => Err(Error::PeerFailure(diagnostic(text))),
        _ => Err(Error::Mismatch {
            expected,
            got: diagnostic(msg.as_str()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;

    /// Scripted serial source. Yields one `WouldBlock` before the data so
    /// the init-time drain does not eat the script, then the bytes, then
    /// `WouldBlock` forever.
    struct ScriptRx {
        data: ArrayVec<[u8; 512]>,
        pos: usize,
        primed: bool,
    }

    impl ScriptRx {
        fn new(script: &[u8]) -> Self {
            let mut data = ArrayVec::new();
            data.try_extend_from_slice(script).unwrap();
            ScriptRx {
                data,
                pos: 0,
                primed: false,
            }
        }
    }

    impl Read<u8> for ScriptRx {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, Self::Error> {
            if !self.primed {
                self.primed = true;
                return Err(nb::Error::WouldBlock);
            }
            if self.pos >= self.data.len() {
                return Err(nb::Error::WouldBlock);
            }
            let byte = self.data[self.pos];
            self.pos += 1;
            Ok(byte)
        }
    }

    /// Records every byte written, for asserting outbound command order.
    struct RecordTx {
        sent: ArrayVec<[u8; 512]>,
    }

    impl RecordTx {
        fn new() -> Self {
            RecordTx {
                sent: ArrayVec::new(),
            }
        }
    }

    impl Write<u8> for RecordTx {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
            self.sent.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Self::Error> {
            Ok(())
        }
    }

    /// Write half that fails immediately.
    struct BrokenTx;

    impl Write<u8> for BrokenTx {
        type Error = ();

        fn write(&mut self, _word: u8) -> nb::Result<(), Self::Error> {
            Err(nb::Error::Other(()))
        }

        fn flush(&mut self) -> nb::Result<(), Self::Error> {
            Err(nb::Error::Other(()))
        }
    }

    struct NoDelay;

    impl DelayMs<u16> for NoDelay {
        fn delay_ms(&mut self, _ms: u16) {}
    }

    type TestBridge = FpBridge<RecordTx, ScriptRx, NoDelay>;

    fn bridge(script: &[u8]) -> TestBridge {
        FpBridge::new(RecordTx::new(), ScriptRx::new(script), NoDelay)
    }

    /// A bridge that already passed the init handshake, scripted with the
    /// given replies for the rest of the test.
    fn ready_bridge(script: &[u8]) -> TestBridge {
        let mut full = ArrayVec::<[u8; 512]>::new();
        full.try_extend_from_slice(b"<RESP:SENSOR_READY,CAP:200>\n")
            .unwrap();
        full.try_extend_from_slice(script).unwrap();
        let mut link = bridge(&full);
        link.initialize().unwrap();
        link.tx.sent.clear();
        link
    }

    fn sent(link: &TestBridge) -> &str {
        core::str::from_utf8(&link.tx.sent).unwrap()
    }

    #[test]
    fn initialize_reaches_ready_and_parses_capacity() {
        let mut link = bridge(b"<RESP:SENSOR_READY,CAP:200>\n");
        link.initialize().unwrap();
        assert_eq!(link.state(), ChannelState::Ready);
        assert_eq!(link.capacity(), Some(200));
        assert_eq!(sent(&link), "<INIT_SENSOR>\n");
    }

    #[test]
    fn initialize_without_capacity_is_still_ready() {
        let mut link = bridge(b"<RESP:SENSOR_READY>");
        link.initialize().unwrap();
        assert_eq!(link.state(), ChannelState::Ready);
        assert_eq!(link.capacity(), None);
    }

    #[test]
    fn initialize_fails_on_sensor_error() {
        let mut link = bridge(b"<RESP:SENSOR_ERROR>");
        let got = link.initialize();
        assert_eq!(
            got,
            Err(Error::PeerFailure(diagnostic("SENSOR_ERROR")))
        );
        assert_eq!(link.state(), ChannelState::Failed);
    }

    #[test]
    fn initialize_times_out_without_a_reply() {
        let mut link = bridge(b"");
        assert_eq!(link.initialize(), Err(Error::Timeout));
        assert_eq!(link.state(), ChannelState::Failed);
    }

    #[test]
    fn initialize_from_ready_requires_reset() {
        let mut link = bridge(b"<RESP:SENSOR_READY>");
        link.initialize().unwrap();
        assert_eq!(link.initialize(), Err(Error::NotReady));
        link.reset();
        assert_eq!(link.state(), ChannelState::Disconnected);
    }

    #[test]
    fn initialize_can_be_retried_after_failure() {
        let mut link = bridge(b"<RESP:SENSOR_ERROR>");
        assert!(link.initialize().is_err());
        assert_eq!(link.state(), ChannelState::Failed);
        // A failed channel may attempt the handshake again; it is not
        // rejected as NotReady even though this retry also finds nothing.
        assert_eq!(link.initialize(), Err(Error::Timeout));
    }

    #[test]
    fn sessions_require_ready_channel() {
        let mut link = bridge(b"");
        assert_eq!(link.template_count(), Err(Error::NotReady));

        let mut enroll = Enrollment::new(5, EnrollOptions::default()).unwrap();
        assert_eq!(enroll.step(&mut link), Err(Error::NotReady));

        let mut ident = Identification::new();
        assert_eq!(ident.step(&mut link), Err(Error::NotReady));
    }

    #[test]
    fn send_command_write_failure_is_transport() {
        let mut link = FpBridge::new(BrokenTx, ScriptRx::new(b""), NoDelay);
        assert_eq!(
            link.send_command(Command::Count),
            Err(Error::Transport(Direction::Send))
        );
    }

    #[test]
    fn template_count_parses_the_result() {
        let mut link = ready_bridge(b"<RESP:COUNT_RESULT:5>\n");
        assert_eq!(link.template_count().unwrap(), 5);
        assert_eq!(sent(&link), "<COUNT>\n");
    }

    #[test]
    fn template_count_reports_peer_failure() {
        let mut link = ready_bridge(b"<RESP:FAIL:whatever>\n");
        assert_eq!(
            link.template_count(),
            Err(Error::PeerFailure(diagnostic("FAIL:whatever")))
        );
    }

    #[test]
    fn template_count_flags_malformed_number() {
        let mut link = ready_bridge(b"<RESP:COUNT_RESULT:five>\n");
        assert_eq!(
            link.template_count(),
            Err(Error::DataIntegrity(IntegrityFault::BadNumber))
        );
    }

    #[test]
    fn enrollment_rejects_out_of_range_slots() {
        assert_eq!(
            Enrollment::new(0, EnrollOptions::default()).unwrap_err(),
            Error::InvalidSlot(0)
        );
        assert_eq!(
            Enrollment::new(128, EnrollOptions::default()).unwrap_err(),
            Error::InvalidSlot(128)
        );
    }

    const HAPPY_ENROLL: &[u8] = b"<RESP:ASK_PLACE_FINGER>\
        <RESP:OK:IMAGE1_TAKEN>\
        <RESP:OK:CONVERT1_DONE>\
        <RESP:ASK_REMOVE_FINGER>\
        <RESP:FINGER_REMOVED>\
        <RESP:ASK_PLACE_AGAIN>\
        <RESP:OK:IMAGE2_TAKEN>\
        <RESP:OK:CONVERT2_DONE>\
        <RESP:OK:MODEL_CREATED>";

    fn drive(
        enroll: &mut Enrollment,
        link: &mut TestBridge,
    ) -> Result<EnrollProgress, Error> {
        loop {
            match enroll.step(link)? {
                EnrollProgress::Working => continue,
                other => return Ok(other),
            }
        }
    }

    #[test]
    fn enrollment_happy_path_sends_commands_in_order() {
        let mut script = ArrayVec::<[u8; 512]>::new();
        script.try_extend_from_slice(HAPPY_ENROLL).unwrap();
        script
            .try_extend_from_slice(b"<RESP:OK:STORED:35>")
            .unwrap();
        let mut link = ready_bridge(&script);
        let mut enroll = Enrollment::new(35, EnrollOptions::default()).unwrap();

        assert_eq!(drive(&mut enroll, &mut link), Ok(EnrollProgress::PlaceFinger));
        assert_eq!(drive(&mut enroll, &mut link), Ok(EnrollProgress::RemoveFinger));
        assert_eq!(
            drive(&mut enroll, &mut link),
            Ok(EnrollProgress::PlaceSameFinger)
        );
        assert_eq!(drive(&mut enroll, &mut link), Ok(EnrollProgress::Done));

        assert_eq!(
            sent(&link),
            "<ENROLL,35>\n<GET_IMAGE>\n<IMAGE_TO_TZ1>\n<REMOVE_FINGER_ACK>\n\
             <GET_IMAGE>\n<IMAGE_TO_TZ2>\n<CREATE_MODEL>\n<STORE_MODEL>\n"
        );
        assert_eq!(enroll.template(), None);
    }

    #[test]
    fn enrollment_aborts_at_first_unexpected_response() {
        let mut link = ready_bridge(b"<RESP:NOT_FOUND>");
        let mut enroll = Enrollment::new(35, EnrollOptions::default()).unwrap();

        let got = enroll.step(&mut link);
        assert_eq!(
            got,
            Err(Error::Mismatch {
                expected: "ASK_PLACE_FINGER",
                got: diagnostic("NOT_FOUND"),
            })
        );
        // Nothing after the failing step was ever sent.
        assert_eq!(sent(&link), "<ENROLL,35>\n");
        // And the session is dead.
        assert_eq!(enroll.step(&mut link), Err(Error::NotReady));
    }

    #[test]
    fn enrollment_reports_mismatch_distinctly() {
        let mut script = ArrayVec::<[u8; 512]>::new();
        script
            .try_extend_from_slice(&HAPPY_ENROLL[..HAPPY_ENROLL.len() - "<RESP:OK:MODEL_CREATED>".len()])
            .unwrap();
        script
            .try_extend_from_slice(b"<RESP:ENROLL_MISMATCH>")
            .unwrap();
        let mut link = ready_bridge(&script);
        let mut enroll = Enrollment::new(35, EnrollOptions::default()).unwrap();

        drive(&mut enroll, &mut link).unwrap(); // PlaceFinger
        drive(&mut enroll, &mut link).unwrap(); // RemoveFinger
        drive(&mut enroll, &mut link).unwrap(); // PlaceSameFinger
        assert_eq!(drive(&mut enroll, &mut link), Err(Error::EnrollMismatch));
        // STORE_MODEL must never go out after the failure.
        assert!(!sent(&link).contains("STORE_MODEL"));
    }

    #[test]
    fn enrollment_no_finger_is_distinguished() {
        let mut link = ready_bridge(b"<RESP:ASK_PLACE_FINGER><RESP:NO_FINGER>");
        let mut enroll = Enrollment::new(35, EnrollOptions::default()).unwrap();

        assert_eq!(enroll.step(&mut link), Ok(EnrollProgress::PlaceFinger));
        assert_eq!(enroll.step(&mut link), Err(Error::NoFinger));
    }

    fn download_options() -> EnrollOptions {
        EnrollOptions {
            download_template: true,
            store_in_module: true,
        }
    }

    fn enroll_with_download(tail: &[u8]) -> (TestBridge, Enrollment) {
        let mut script = ArrayVec::<[u8; 512]>::new();
        script.try_extend_from_slice(HAPPY_ENROLL).unwrap();
        script
            .try_extend_from_slice(b"<RESP:OK:TEMPLATE_UPLOAD_CMD_ACKNOWLEDGED>")
            .unwrap();
        script.try_extend_from_slice(tail).unwrap();
        let link = ready_bridge(&script);
        let enroll = Enrollment::new(12, download_options()).unwrap();
        (link, enroll)
    }

    #[test]
    fn template_download_reassembles_chunks() {
        let (mut link, mut enroll) = enroll_with_download(
            b"<RESP:TEMPLATE_CHUNK:AABB>\
              <RESP:TEMPLATE_CHUNK:01>\
              <RESP:OK:TEMPLATE_DOWNLOAD_COMPLETE:3>\
              <RESP:OK:STORED:12>",
        );

        drive(&mut enroll, &mut link).unwrap(); // PlaceFinger
        drive(&mut enroll, &mut link).unwrap(); // RemoveFinger
        drive(&mut enroll, &mut link).unwrap(); // PlaceSameFinger
        assert_eq!(
            drive(&mut enroll, &mut link),
            Ok(EnrollProgress::TemplateReady)
        );
        assert_eq!(enroll.template(), Some(&[0xAA, 0xBB, 0x01][..]));
        assert_eq!(enroll.skipped_messages(), 0);
        assert_eq!(drive(&mut enroll, &mut link), Ok(EnrollProgress::Done));
    }

    #[test]
    fn template_download_rejects_corrupted_count() {
        let (mut link, mut enroll) = enroll_with_download(
            b"<RESP:TEMPLATE_CHUNK:AABB>\
              <RESP:OK:TEMPLATE_DOWNLOAD_COMPLETE:5>",
        );

        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        assert_eq!(
            drive(&mut enroll, &mut link),
            Err(Error::DataIntegrity(IntegrityFault::LengthMismatch {
                reported: 5,
                actual: 2,
            }))
        );
    }

    #[test]
    fn template_download_skips_unrecognized_messages() {
        let (mut link, mut enroll) = enroll_with_download(
            b"<RESP:TEMPLATE_CHUNK:FF>\
              <heap check ok>\
              <RESP:OK:TEMPLATE_DOWNLOAD_COMPLETE:1>\
              <RESP:OK:STORED:12>",
        );

        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        assert_eq!(
            drive(&mut enroll, &mut link),
            Ok(EnrollProgress::TemplateReady)
        );
        assert_eq!(enroll.skipped_messages(), 1);
    }

    #[test]
    fn store_requires_the_exact_enrolled_slot() {
        let mut script = ArrayVec::<[u8; 512]>::new();
        script.try_extend_from_slice(HAPPY_ENROLL).unwrap();
        script
            .try_extend_from_slice(b"<RESP:OK:STORED:13>")
            .unwrap();
        let mut link = ready_bridge(&script);
        let mut enroll = Enrollment::new(12, EnrollOptions::default()).unwrap();

        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        drive(&mut enroll, &mut link).unwrap();
        assert_eq!(
            drive(&mut enroll, &mut link),
            Err(Error::Mismatch {
                expected: "OK:STORED:<slot>",
                got: diagnostic("OK:STORED:13"),
            })
        );
    }

    #[test]
    fn identification_finds_a_match() {
        let mut link = ready_bridge(
            b"<RESP:ASK_PLACE_FINGER>\
              <RESP:OK:IMAGE_TAKEN>\
              <RESP:OK:CONVERT_DONE>\
              <RESP:ID_FOUND:12,CONFIDENCE:150>",
        );
        let mut ident = Identification::new();

        assert_eq!(ident.step(&mut link), Ok(IdentifyProgress::PlaceFinger));
        assert_eq!(ident.step(&mut link), Ok(IdentifyProgress::Working));
        assert_eq!(ident.step(&mut link), Ok(IdentifyProgress::Working));
        assert_eq!(
            ident.step(&mut link),
            Ok(IdentifyProgress::Done(IdentifyOutcome::Match {
                slot: 12,
                confidence: 150,
            }))
        );
        assert_eq!(sent(&link), "<IDENTIFY>\n<GET_IMAGE>\n<IMAGE_TO_TZ1>\n");
    }

    #[test]
    fn identification_handles_not_found() {
        let mut link = ready_bridge(
            b"<RESP:ASK_PLACE_FINGER>\
              <RESP:OK:IMAGE_TAKEN>\
              <RESP:OK:CONVERT_DONE>\
              <RESP:NOT_FOUND>",
        );
        let mut ident = Identification::new();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        assert_eq!(
            ident.step(&mut link),
            Ok(IdentifyProgress::Done(IdentifyOutcome::NoMatch))
        );
    }

    #[test]
    fn identification_no_finger_is_distinguished() {
        let mut link = ready_bridge(b"<RESP:ASK_PLACE_FINGER><RESP:NO_FINGER>");
        let mut ident = Identification::new();
        ident.step(&mut link).unwrap();
        assert_eq!(ident.step(&mut link), Err(Error::NoFinger));
        // The session stopped before converting anything.
        assert!(!sent(&link).contains("IMAGE_TO_TZ1"));
    }

    #[test]
    fn identification_reports_garbled_match_as_diagnostic() {
        let mut link = ready_bridge(
            b"<RESP:ASK_PLACE_FINGER>\
              <RESP:OK:IMAGE_TAKEN>\
              <RESP:OK:CONVERT_DONE>\
              <RESP:ID_FOUND:bogus,CONFIDENCE:150>",
        );
        let mut ident = Identification::new();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        assert_eq!(
            ident.step(&mut link),
            Ok(IdentifyProgress::Done(IdentifyOutcome::MatchGarbled(
                diagnostic("ID_FOUND:bogus,CONFIDENCE:150")
            )))
        );
    }

    #[test]
    fn identification_surfaces_unrecognized_replies() {
        let mut link = ready_bridge(
            b"<RESP:ASK_PLACE_FINGER>\
              <RESP:OK:IMAGE_TAKEN>\
              <RESP:OK:CONVERT_DONE>\
              <RESP:SOMETHING_ELSE>",
        );
        let mut ident = Identification::new();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        ident.step(&mut link).unwrap();
        assert_eq!(
            ident.step(&mut link),
            Ok(IdentifyProgress::Done(IdentifyOutcome::Unrecognized(
                diagnostic("SOMETHING_ELSE")
            )))
        );
    }
}
