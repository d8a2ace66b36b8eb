use arrayvec::ArrayString;

/// Fixed prefix the bridge puts on protocol responses. Stripped when a frame
/// is decoded; frames without it are firmware diagnostics and pass through
/// unchanged.
pub const RESPONSE_PREFIX: &str = "RESP:";

/// Largest payload a single frame may carry, in bytes.
pub const MESSAGE_CAPACITY: usize = 256;

/// The decoded, prefix-stripped content of one received frame.
///
/// Immutable value data; owned by whoever called `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    text: ArrayString<[u8; MESSAGE_CAPACITY]>,
}

impl Message {
    /// Builds a message from a raw frame payload, stripping the
    /// [`RESPONSE_PREFIX`] if present.
    pub(crate) fn from_payload(payload: &str) -> Self {
        let body = if payload.starts_with(RESPONSE_PREFIX) {
            &payload[RESPONSE_PREFIX.len()..]
        } else {
            payload
        };
        let mut text = ArrayString::new();
        // The body never exceeds the frame accumulator's capacity.
        let _ = text.try_push_str(body);
        Message { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Classifies the message into the bridge's response vocabulary.
    pub fn reply(&self) -> Reply<'_> {
        Reply::parse(self.as_str())
    }
}

/// Structured view of a received [`Message`]. Borrows from the message.
///
/// Token matching is anchored at the start of the payload; anything outside
/// the known vocabulary comes back as [`Reply::Unrecognized`] with the text
/// preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply<'a> {
    /// Sensor initialized. Capacity is parsed best-effort from an optional
    /// `,CAP:<n>` suffix and is `None` when absent or malformed.
    SensorReady { capacity: Option<u16> },
    /// Sensor failed to initialize.
    SensorError,
    AskPlaceFinger,
    AskRemoveFinger,
    AskPlaceAgain,
    FingerRemoved,
    NoFinger,
    /// The two enrollment captures did not come from the same finger.
    EnrollMismatch,
    /// Identification search found nothing.
    NotFound,
    /// Identification search hit. Fields are `None` when the peer sent a
    /// malformed number; the caller reports that as a diagnostic, not a
    /// hard failure.
    IdFound {
        slot: Option<u16>,
        confidence: Option<u16>,
    },
    /// `COUNT_RESULT:<n>`; `None` when the count did not parse.
    CountResult(Option<u16>),
    /// One hex-encoded piece of a template transfer.
    TemplateChunk(&'a str),
    /// An `OK:<detail>` acknowledgment.
    Ok(Ack<'a>),
    /// The peer reported a failure. Carries the whole payload verbatim.
    /// Matches any payload whose leading token contains `FAIL`, which keeps
    /// firmware codes like `IMAGE_FAIL` in the failure class.
    Fail(&'a str),
    /// Anything outside the known vocabulary, verbatim.
    Unrecognized(&'a str),
}

impl<'a> Reply<'a> {
    pub fn parse(text: &'a str) -> Reply<'a> {
        match text {
            "SENSOR_ERROR" => return Reply::SensorError,
            "ASK_PLACE_FINGER" => return Reply::AskPlaceFinger,
            "ASK_REMOVE_FINGER" => return Reply::AskRemoveFinger,
            "ASK_PLACE_AGAIN" => return Reply::AskPlaceAgain,
            "FINGER_REMOVED" => return Reply::FingerRemoved,
            "NO_FINGER" => return Reply::NoFinger,
            "ENROLL_MISMATCH" => return Reply::EnrollMismatch,
            "NOT_FOUND" => return Reply::NotFound,
            _ => {}
        }

        if text.starts_with("SENSOR_READY") {
            let capacity = text
                .find(",CAP:")
                .and_then(|at| text[at + ",CAP:".len()..].parse().ok());
            return Reply::SensorReady { capacity };
        }

        if text.starts_with("ID_FOUND:") {
            let rest = &text["ID_FOUND:".len()..];
            let mut fields = rest.splitn(2, ",CONFIDENCE:");
            let slot = fields.next().and_then(|s| s.parse().ok());
            let confidence = fields.next().and_then(|s| s.parse().ok());
            return Reply::IdFound { slot, confidence };
        }

        if text.starts_with("COUNT_RESULT:") {
            let n = text["COUNT_RESULT:".len()..].parse().ok();
            return Reply::CountResult(n);
        }

        if text.starts_with("TEMPLATE_CHUNK:") {
            return Reply::TemplateChunk(&text["TEMPLATE_CHUNK:".len()..]);
        }

        if text.starts_with("OK:") {
            return Reply::Ok(Ack::parse(&text["OK:".len()..]));
        }

        // Leading token only, so e.g. IMAGE_FAIL and FEATURE_FAIL classify
        // as peer failures while the argument text stays out of the match.
        let token = text
            .splitn(2, |c| c == ':' || c == ',')
            .next()
            .unwrap_or(text);
        if token.contains("FAIL") {
            return Reply::Fail(text);
        }

        Reply::Unrecognized(text)
    }
}

/// The detail half of an `OK:<detail>` acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack<'a> {
    Image1Taken,
    Image2Taken,
    ImageTaken,
    Convert1Done,
    Convert2Done,
    ConvertDone,
    ModelCreated,
    /// `OK:STORED:<id>`; `None` when the id did not parse.
    Stored(Option<u8>),
    /// The bridge accepted the template download request.
    TemplateUploadAcknowledged,
    /// `OK:TEMPLATE_DOWNLOAD_COMPLETE:<bytes>`; `None` when the byte count
    /// did not parse.
    TemplateDownloadComplete(Option<usize>),
    /// An acknowledgment the host does not know; verbatim.
    Other(&'a str),
}

impl<'a> Ack<'a> {
    fn parse(detail: &'a str) -> Ack<'a> {
        match detail {
            "IMAGE1_TAKEN" => return Ack::Image1Taken,
            "IMAGE2_TAKEN" => return Ack::Image2Taken,
            "IMAGE_TAKEN" => return Ack::ImageTaken,
            "CONVERT1_DONE" => return Ack::Convert1Done,
            "CONVERT2_DONE" => return Ack::Convert2Done,
            "CONVERT_DONE" => return Ack::ConvertDone,
            "MODEL_CREATED" => return Ack::ModelCreated,
            "TEMPLATE_UPLOAD_CMD_ACKNOWLEDGED" => return Ack::TemplateUploadAcknowledged,
            _ => {}
        }

        if detail.starts_with("STORED:") {
            return Ack::Stored(detail["STORED:".len()..].parse().ok());
        }

        if detail.starts_with("TEMPLATE_DOWNLOAD_COMPLETE:") {
            let n = detail["TEMPLATE_DOWNLOAD_COMPLETE:".len()..].parse().ok();
            return Ack::TemplateDownloadComplete(n);
        }

        Ack::Other(detail)
    }
}
