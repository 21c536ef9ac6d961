//! Wire protocol shared between the server and its clients.
//!
//! Everything on the socket is a sequence of self-describing binary frames:
//! a one-byte type tag, a two-byte little-endian body length (the tag and
//! length bytes are not counted), then a type-specific body. The [`protocol`]
//! module holds the message enums for both directions and the codec that
//! turns them into frames and back.

pub mod protocol;

pub use protocol::{
    decode_client, decode_server, encode_client, encode_server, Appearance, ClientMessage,
    FrameError, ServerMessage, FRAME_HEADER_LEN,
};

// Client -> server frame tags.
pub const CS_MOVE_TO: u8 = 1;
pub const CS_SIT_DOWN: u8 = 2;
pub const CS_TURN_LEFT: u8 = 3;
pub const CS_TURN_RIGHT: u8 = 4;
pub const CS_HEARTBEAT: u8 = 14;
pub const CS_LOG_IN: u8 = 140;

// Server -> client frame tags.
pub const SC_RAW_TEXT: u8 = 0;
pub const SC_YOU_ARE: u8 = 3;
pub const SC_NEW_MINUTE: u8 = 5;
pub const SC_REMOVE_ACTOR: u8 = 6;
pub const SC_CHANGE_MAP: u8 = 7;
pub const SC_PONG: u8 = 11;
pub const SC_ADD_ACTOR: u8 = 51;
pub const SC_LOG_IN_OK: u8 = 250;
pub const SC_LOG_IN_NOT_OK: u8 = 251;
