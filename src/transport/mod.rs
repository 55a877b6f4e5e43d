mod frame;
mod packet;

pub use self::frame::{FRAME_OVERHEAD, Frame, FrameCodecError, MAX_FRAME_PAYLOAD};
pub use self::packet::{FrameRecord, PacketTransport, SendReceipt};
