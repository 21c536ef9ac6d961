//! Binary frame codec for both traffic directions.
//!
//! A frame is `[1 byte tag][2 bytes body length, little-endian][body]`; the
//! declared length counts only the body. Numeric fields are fixed-width
//! little-endian. Strings are raw ASCII bytes with no length prefix: they run
//! either to the end of the frame or, for the kinds that say so, to a
//! trailing NUL. A frame whose declared length reads past the available
//! bytes is a recoverable per-message error, never a reason to drop the
//! connection.

use crate::{
    CS_HEARTBEAT, CS_LOG_IN, CS_MOVE_TO, CS_SIT_DOWN, CS_TURN_LEFT, CS_TURN_RIGHT, SC_ADD_ACTOR,
    SC_CHANGE_MAP, SC_LOG_IN_NOT_OK, SC_LOG_IN_OK, SC_NEW_MINUTE, SC_PONG, SC_RAW_TEXT,
    SC_REMOVE_ACTOR, SC_YOU_ARE,
};

/// Bytes taken by the tag and length fields of every frame.
pub const FRAME_HEADER_LEN: usize = 3;

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Credentials as space-separated text ("user password").
    LogIn { credentials: String },
    /// Empty body; resets the connection liveness clock.
    Heartbeat,
    /// Walk request toward a tile.
    MoveTo { x: i16, y: i16 },
    /// Nonzero flag sits the actor down, zero stands it up.
    SitDown { sit: bool },
    TurnLeft,
    TurnRight,
    /// Tag not in the dispatch table; the cursor still advanced past it.
    Unknown { tag: u8 },
}

/// Fixed appearance bytes carried by an actor announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Appearance {
    pub kind: u8,
    pub skin: u8,
    pub hair: u8,
    pub shirt: u8,
    pub pants: u8,
    pub boots: u8,
    pub head: u8,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Announce an actor with appearance, location and NUL-terminated name.
    AddActor {
        id: u16,
        x: u16,
        y: u16,
        z: u8,
        rotation: u16,
        appearance: Appearance,
        name: String,
    },
    RemoveActor {
        id: u16,
    },
    /// Chat/system line: channel byte, color byte, then text to frame end.
    RawText {
        channel: u8,
        color: u8,
        text: String,
    },
    /// NUL-terminated map path.
    ChangeMap {
        path: String,
    },
    NewMinute {
        minute: u16,
    },
    /// Tells a freshly logged-in client its own actor id.
    YouAre {
        id: u16,
    },
    LogInOk,
    LogInNotOk {
        reason: String,
    },
    /// Heartbeat echo, empty body.
    Pong,
    Unknown {
        tag: u8,
    },
}

/// Recoverable per-frame decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes remain than a frame header needs.
    Header { available: usize },
    /// Declared body length reads past the available bytes.
    Truncated {
        tag: u8,
        declared: usize,
        available: usize,
    },
    /// Body present but does not match what the tag requires.
    Payload { tag: u8, declared: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Header { available } => {
                write!(f, "incomplete frame header ({} bytes available)", available)
            }
            FrameError::Truncated {
                tag,
                declared,
                available,
            } => write!(
                f,
                "frame 0x{:02x} declares {} body bytes but only {} are available",
                tag, declared, available
            ),
            FrameError::Payload { tag, declared } => {
                write!(f, "frame 0x{:02x} has a malformed {}-byte body", tag, declared)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Returns the total size of the frame at `offset` if it is fully present.
///
/// `None` means the trailing bytes are an incomplete frame; a reader that
/// carries partial frames across socket drains keeps them for the next pass.
pub fn complete_frame_len(buf: &[u8], offset: usize) -> Option<usize> {
    if offset + FRAME_HEADER_LEN > buf.len() {
        return None;
    }
    let declared = u16::from_le_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
    let total = FRAME_HEADER_LEN + declared;
    if offset + total > buf.len() {
        None
    } else {
        Some(total)
    }
}

/// Decodes one client frame at `offset`, returning the message (or a
/// recoverable error) and the offset of the next frame.
///
/// On a truncated declaration the next offset skips the declared length, per
/// the resynchronization rule, which in practice lands at the buffer end.
pub fn decode_client(buf: &[u8], offset: usize) -> (Result<ClientMessage, FrameError>, usize) {
    let (tag, body, next) = match split_frame(buf, offset) {
        Ok(parts) => parts,
        Err((e, next)) => return (Err(e), next),
    };
    let declared = body.len();
    let msg = match tag {
        CS_LOG_IN => Ok(ClientMessage::LogIn {
            credentials: text_to_end(trim_nul(body)),
        }),
        CS_HEARTBEAT => empty_body(body, tag, declared).map(|_| ClientMessage::Heartbeat),
        CS_MOVE_TO => {
            if body.len() != 4 {
                Err(FrameError::Payload { tag, declared })
            } else {
                Ok(ClientMessage::MoveTo {
                    x: i16::from_le_bytes([body[0], body[1]]),
                    y: i16::from_le_bytes([body[2], body[3]]),
                })
            }
        }
        CS_SIT_DOWN => {
            if body.len() != 1 {
                Err(FrameError::Payload { tag, declared })
            } else {
                Ok(ClientMessage::SitDown { sit: body[0] != 0 })
            }
        }
        CS_TURN_LEFT => empty_body(body, tag, declared).map(|_| ClientMessage::TurnLeft),
        CS_TURN_RIGHT => empty_body(body, tag, declared).map(|_| ClientMessage::TurnRight),
        other => Ok(ClientMessage::Unknown { tag: other }),
    };
    (msg, next)
}

/// Encodes a client message into one complete frame.
pub fn encode_client(msg: &ClientMessage) -> Vec<u8> {
    let (tag, body) = match msg {
        ClientMessage::LogIn { credentials } => (CS_LOG_IN, credentials.as_bytes().to_vec()),
        ClientMessage::Heartbeat => (CS_HEARTBEAT, Vec::new()),
        ClientMessage::MoveTo { x, y } => {
            let mut b = Vec::with_capacity(4);
            b.extend_from_slice(&x.to_le_bytes());
            b.extend_from_slice(&y.to_le_bytes());
            (CS_MOVE_TO, b)
        }
        ClientMessage::SitDown { sit } => (CS_SIT_DOWN, vec![u8::from(*sit)]),
        ClientMessage::TurnLeft => (CS_TURN_LEFT, Vec::new()),
        ClientMessage::TurnRight => (CS_TURN_RIGHT, Vec::new()),
        ClientMessage::Unknown { tag } => (*tag, Vec::new()),
    };
    frame(tag, &body)
}

/// Decodes one server frame at `offset`; same contract as [`decode_client`].
pub fn decode_server(buf: &[u8], offset: usize) -> (Result<ServerMessage, FrameError>, usize) {
    let (tag, body, next) = match split_frame(buf, offset) {
        Ok(parts) => parts,
        Err((e, next)) => return (Err(e), next),
    };
    let declared = body.len();
    let msg = match tag {
        SC_ADD_ACTOR => decode_add_actor(body, tag, declared),
        SC_REMOVE_ACTOR => u16_body(body, tag, declared).map(|id| ServerMessage::RemoveActor { id }),
        SC_RAW_TEXT => {
            if body.len() < 2 {
                Err(FrameError::Payload { tag, declared })
            } else {
                Ok(ServerMessage::RawText {
                    channel: body[0],
                    color: body[1],
                    text: text_to_end(&body[2..]),
                })
            }
        }
        SC_CHANGE_MAP => match split_cstr(body) {
            Some((path, rest)) if rest.is_empty() => Ok(ServerMessage::ChangeMap {
                path: text_to_end(path),
            }),
            _ => Err(FrameError::Payload { tag, declared }),
        },
        SC_NEW_MINUTE => u16_body(body, tag, declared).map(|minute| ServerMessage::NewMinute { minute }),
        SC_YOU_ARE => u16_body(body, tag, declared).map(|id| ServerMessage::YouAre { id }),
        SC_LOG_IN_OK => empty_body(body, tag, declared).map(|_| ServerMessage::LogInOk),
        SC_LOG_IN_NOT_OK => Ok(ServerMessage::LogInNotOk {
            reason: text_to_end(body),
        }),
        SC_PONG => empty_body(body, tag, declared).map(|_| ServerMessage::Pong),
        other => Ok(ServerMessage::Unknown { tag: other }),
    };
    (msg, next)
}

/// Encodes a server message into one complete frame.
pub fn encode_server(msg: &ServerMessage) -> Vec<u8> {
    let (tag, body) = match msg {
        ServerMessage::AddActor {
            id,
            x,
            y,
            z,
            rotation,
            appearance,
            name,
        } => {
            let mut b = Vec::with_capacity(16 + name.len() + 1);
            b.extend_from_slice(&id.to_le_bytes());
            b.extend_from_slice(&x.to_le_bytes());
            b.extend_from_slice(&y.to_le_bytes());
            b.push(*z);
            b.extend_from_slice(&rotation.to_le_bytes());
            b.extend_from_slice(&[
                appearance.kind,
                appearance.skin,
                appearance.hair,
                appearance.shirt,
                appearance.pants,
                appearance.boots,
                appearance.head,
            ]);
            b.extend_from_slice(name.as_bytes());
            b.push(0);
            (SC_ADD_ACTOR, b)
        }
        ServerMessage::RemoveActor { id } => (SC_REMOVE_ACTOR, id.to_le_bytes().to_vec()),
        ServerMessage::RawText {
            channel,
            color,
            text,
        } => {
            let mut b = Vec::with_capacity(2 + text.len());
            b.push(*channel);
            b.push(*color);
            b.extend_from_slice(text.as_bytes());
            (SC_RAW_TEXT, b)
        }
        ServerMessage::ChangeMap { path } => {
            let mut b = Vec::with_capacity(path.len() + 1);
            b.extend_from_slice(path.as_bytes());
            b.push(0);
            (SC_CHANGE_MAP, b)
        }
        ServerMessage::NewMinute { minute } => (SC_NEW_MINUTE, minute.to_le_bytes().to_vec()),
        ServerMessage::YouAre { id } => (SC_YOU_ARE, id.to_le_bytes().to_vec()),
        ServerMessage::LogInOk => (SC_LOG_IN_OK, Vec::new()),
        ServerMessage::LogInNotOk { reason } => (SC_LOG_IN_NOT_OK, reason.as_bytes().to_vec()),
        ServerMessage::Pong => (SC_PONG, Vec::new()),
        ServerMessage::Unknown { tag } => (*tag, Vec::new()),
    };
    frame(tag, &body)
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    debug_assert!(body.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Splits the frame at `offset` into tag, body slice and next-frame offset.
#[allow(clippy::type_complexity)]
fn split_frame(buf: &[u8], offset: usize) -> Result<(u8, &[u8], usize), (FrameError, usize)> {
    let available = buf.len().saturating_sub(offset);
    if available < FRAME_HEADER_LEN {
        return Err((FrameError::Header { available }, buf.len()));
    }
    let tag = buf[offset];
    let declared = u16::from_le_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
    let body_start = offset + FRAME_HEADER_LEN;
    let next = (body_start + declared).min(buf.len());
    if body_start + declared > buf.len() {
        return Err((
            FrameError::Truncated {
                tag,
                declared,
                available: buf.len() - body_start,
            },
            next,
        ));
    }
    Ok((tag, &buf[body_start..body_start + declared], body_start + declared))
}

fn decode_add_actor(body: &[u8], tag: u8, declared: usize) -> Result<ServerMessage, FrameError> {
    // Fixed part: id(2) x(2) y(2) z(1) rotation(2) appearance(7).
    if body.len() < 16 {
        return Err(FrameError::Payload { tag, declared });
    }
    let (name, rest) = match split_cstr(&body[16..]) {
        Some(parts) => parts,
        None => return Err(FrameError::Payload { tag, declared }),
    };
    if !rest.is_empty() {
        return Err(FrameError::Payload { tag, declared });
    }
    Ok(ServerMessage::AddActor {
        id: u16::from_le_bytes([body[0], body[1]]),
        x: u16::from_le_bytes([body[2], body[3]]),
        y: u16::from_le_bytes([body[4], body[5]]),
        z: body[6],
        rotation: u16::from_le_bytes([body[7], body[8]]),
        appearance: Appearance {
            kind: body[9],
            skin: body[10],
            hair: body[11],
            shirt: body[12],
            pants: body[13],
            boots: body[14],
            head: body[15],
        },
        name: text_to_end(name),
    })
}

fn empty_body(body: &[u8], tag: u8, declared: usize) -> Result<(), FrameError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(FrameError::Payload { tag, declared })
    }
}

fn u16_body(body: &[u8], tag: u8, declared: usize) -> Result<u16, FrameError> {
    if body.len() != 2 {
        Err(FrameError::Payload { tag, declared })
    } else {
        Ok(u16::from_le_bytes([body[0], body[1]]))
    }
}

fn text_to_end(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.split_last() {
        Some((0, rest)) => rest,
        _ => bytes,
    }
}

/// Splits at the first NUL: (before, after-the-NUL). None if no NUL exists.
fn split_cstr(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| b == 0)?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}
