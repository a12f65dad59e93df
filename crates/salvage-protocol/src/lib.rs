mod codec;
mod messages;

pub use codec::{NdJsonCodec, DEFAULT_MAX_FRAME_BYTES};
pub use messages::{
    Envelope, ErrorData, HeartbeatAckData, HeartbeatData, Payload, RegisterAckData, RegisterData,
    ResultStatus, StatusQueryData, StatusReplyData, TaskAssignData, TaskCancelData, TaskResultData,
};
