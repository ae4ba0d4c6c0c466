//! Streaming protocol types for interactive exec/attach sessions.
//!
//! After the HTTP upgrade both sides exchange channel-tagged frames.
//!
//! Wire format: `[channel: u8] [length: u32 BE] [payload: length bytes]`

use serde::{Deserialize, Serialize};
use std::io;

/// Maximum frame payload size: 1 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Frame header size: channel byte plus big-endian length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Channel: local stdin (client → server).
pub const CHANNEL_STDIN: u8 = 0;
/// Channel: remote stdout (server → client).
pub const CHANNEL_STDOUT: u8 = 1;
/// Channel: remote stderr (server → client).
pub const CHANNEL_STDERR: u8 = 2;
/// Channel: session status or error (server → client).
pub const CHANNEL_ERROR: u8 = 3;
/// Channel: terminal resize (client → server).
pub const CHANNEL_RESIZE: u8 = 4;

/// Request header listing the sub-protocols the client offers; the
/// server echoes its choice in the same header on `101`.
pub const STREAM_PROTOCOL_HEADER: &str = "X-Stream-Protocol-Version";

/// Response header a server may use to list what it would have accepted.
pub const ACCEPTED_PROTOCOLS_HEADER: &str = "X-Accepted-Stream-Protocol-Versions";

/// Upgrade token sent on the streaming request.
pub const UPGRADE_TOKEN: &str = "tcp";

pub const PROTOCOL_V4: &str = "v4.channel.k8s.io";
pub const PROTOCOL_V3: &str = "v3.channel.k8s.io";
pub const PROTOCOL_V2: &str = "v2.channel.k8s.io";
pub const PROTOCOL_V1: &str = "channel.k8s.io";

/// Sub-protocols this client speaks, most preferred first.
pub const SUPPORTED_STREAM_PROTOCOLS: [&str; 4] =
    [PROTOCOL_V4, PROTOCOL_V3, PROTOCOL_V2, PROTOCOL_V1];

/// Pick the protocol to use from a client's offer.
///
/// The server's preference order wins; `None` when nothing overlaps.
pub fn select_protocol<'a>(offered: &[&str], supported: &[&'a str]) -> Option<&'a str> {
    supported
        .iter()
        .copied()
        .find(|candidate| offered.contains(candidate))
}

/// Encode a frame.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(channel);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a frame header into (channel, payload length).
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> io::Result<(u8, usize)> {
    let channel = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "stream frame too large: {} bytes (max {})",
                len, MAX_FRAME_PAYLOAD
            ),
        ));
    }
    Ok((channel, len))
}

/// Terminal size sent on the resize channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

/// Status object carried on the error channel by `v4.channel.k8s.io`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Status value for a successful command.
pub const STATUS_SUCCESS: &str = "Success";
/// Status value for a failed command.
pub const STATUS_FAILURE: &str = "Failure";
/// Reason used when the command exited non-zero.
pub const REASON_NON_ZERO_EXIT: &str = "NonZeroExitCode";
/// Cause reason whose message holds the exit code.
pub const CAUSE_EXIT_CODE: &str = "ExitCode";

impl StreamStatus {
    /// Status reporting a clean exit.
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }

    /// Status reporting a non-zero exit code.
    pub fn exit_code(code: i32) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message: format!("command terminated with non-zero exit code: {}", code),
            reason: REASON_NON_ZERO_EXIT.to_string(),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    reason: CAUSE_EXIT_CODE.to_string(),
                    message: code.to_string(),
                }],
            }),
        }
    }

    /// Interpret the status as a process exit code.
    ///
    /// `Err` carries the remote error message when the failure is not an
    /// exit code.
    pub fn into_exit_code(self) -> std::result::Result<i32, String> {
        if self.status == STATUS_SUCCESS {
            return Ok(0);
        }
        if self.reason == REASON_NON_ZERO_EXIT {
            let code = self
                .details
                .iter()
                .flat_map(|d| d.causes.iter())
                .find(|c| c.reason == CAUSE_EXIT_CODE)
                .and_then(|c| c.message.parse::<i32>().ok());
            if let Some(code) = code {
                return Ok(code);
            }
        }
        Err(if self.message.is_empty() {
            format!("remote command failed: {}", self.status)
        } else {
            self.message
        })
    }
}
