//! Control protocol: typed messages and their framing

pub mod messages;
pub mod codec;

pub use messages::{
    ControlOp, ControlReply, MapGrant, Request, Response, WireError, XferInfo,
};
pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
