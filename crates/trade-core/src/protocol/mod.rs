//! Protocol module containing the frame codec and the message model.

pub mod frame;
pub mod messages;

pub use frame::{
    decode_frame, encode_frame, DecodeStatus, Frame, FrameDecoder, FrameError, FrameHeader,
    HEADER_SIZE,
};
pub use messages::*;
