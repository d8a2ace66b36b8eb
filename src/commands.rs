use crate::utils::{write_decimal, CommandWriter, ToPayload};

//# Command names follow the bridge firmware's serial vocabulary. Each command
//# travels as `<PAYLOAD>\n`; only the payload is rendered here, the driver
//# adds the markers and the line terminator.

/// Enum for commands the host can send to the bridge.
///
/// `DELETE` and `EMPTY` exist in the firmware's vocabulary but are reserved
/// and unimplemented on the peer, so they are deliberately absent here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Asks the bridge to initialize the fingerprint sensor. Sent once per
    /// connection, before anything else.
    InitSensor,

    /// Starts an enrollment for the given flash slot.
    Enroll {
        /// Flash slot the template will be stored under (1-127).
        slot: u8,
    },

    /// Starts an identification (1:N search) flow.
    Identify,

    /// Asks how many templates the sensor currently stores.
    Count,

    /// Captures a fingerprint image into the sensor's image buffer.
    GetImage,

    /// Converts the captured image into _character buffer_ 1.
    ImageToTz1,

    /// Converts the captured image into _character buffer_ 2.
    ImageToTz2,

    /// Combines both character buffers into a template model.
    CreateModel,

    /// Stores the created model into sensor flash at the enrolled slot.
    StoreModel,

    /// Confirms to the bridge that the user was told to lift their finger.
    RemoveFingerAck,

    /// Requests a chunked upload of the template in character buffer 1.
    DownloadTemplate,
}

impl ToPayload for Command {
    fn to_payload(&self, writer: &mut dyn CommandWriter) {
        match self {
            // Wire form: <INIT_SENSOR>
            Self::InitSensor => writer.write_cmd_bytes(b"INIT_SENSOR"),

            // Wire form: <ENROLL,42>
            Self::Enroll { slot } => {
                writer.write_cmd_bytes(b"ENROLL,");
                write_decimal(writer, u16::from(*slot));
            }

            // Wire form: <IDENTIFY>
            Self::Identify => writer.write_cmd_bytes(b"IDENTIFY"),

            // Wire form: <COUNT>
            Self::Count => writer.write_cmd_bytes(b"COUNT"),

            // Wire form: <GET_IMAGE>
            Self::GetImage => writer.write_cmd_bytes(b"GET_IMAGE"),

            // Wire form: <IMAGE_TO_TZ1>
            Self::ImageToTz1 => writer.write_cmd_bytes(b"IMAGE_TO_TZ1"),

            // Wire form: <IMAGE_TO_TZ2>
            Self::ImageToTz2 => writer.write_cmd_bytes(b"IMAGE_TO_TZ2"),

            // Wire form: <CREATE_MODEL>
            Self::CreateModel => writer.write_cmd_bytes(b"CREATE_MODEL"),

            // Wire form: <STORE_MODEL>
            Self::StoreModel => writer.write_cmd_bytes(b"STORE_MODEL"),

            // Wire form: <REMOVE_FINGER_ACK>
            Self::RemoveFingerAck => writer.write_cmd_bytes(b"REMOVE_FINGER_ACK"),

            // Wire form: <DOWNLOAD_TPL_B1>
            Self::DownloadTemplate => writer.write_cmd_bytes(b"DOWNLOAD_TPL_B1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;

    fn render(cmd: Command) -> ArrayVec<[u8; 64]> {
        let mut buf = ArrayVec::new();
        cmd.to_payload(&mut buf);
        buf
    }

    #[test]
    fn plain_commands_render_their_token() {
        assert_eq!(&render(Command::InitSensor)[..], b"INIT_SENSOR");
        assert_eq!(&render(Command::Identify)[..], b"IDENTIFY");
        assert_eq!(&render(Command::Count)[..], b"COUNT");
        assert_eq!(&render(Command::GetImage)[..], b"GET_IMAGE");
        assert_eq!(&render(Command::ImageToTz1)[..], b"IMAGE_TO_TZ1");
        assert_eq!(&render(Command::ImageToTz2)[..], b"IMAGE_TO_TZ2");
        assert_eq!(&render(Command::CreateModel)[..], b"CREATE_MODEL");
        assert_eq!(&render(Command::StoreModel)[..], b"STORE_MODEL");
        assert_eq!(&render(Command::RemoveFingerAck)[..], b"REMOVE_FINGER_ACK");
        assert_eq!(&render(Command::DownloadTemplate)[..], b"DOWNLOAD_TPL_B1");
    }

    #[test]
    fn enroll_includes_the_slot_argument() {
        assert_eq!(&render(Command::Enroll { slot: 1 })[..], b"ENROLL,1");
        assert_eq!(&render(Command::Enroll { slot: 42 })[..], b"ENROLL,42");
        assert_eq!(&render(Command::Enroll { slot: 127 })[..], b"ENROLL,127");
    }
}
