//! Gateway wire protocol: op codes, close codes, frame shapes and payloads

pub mod close_codes;
pub mod commands;
pub mod dispatch;
pub mod intents;
pub mod opcodes;
pub mod payload;

pub use close_codes::{classify, CloseCode, CloseDisposition, SessionAction};
pub use commands::{
    Activity, IdentifyPayload, IdentifyProperties, MemberRequest, Presence, RequestGuildMembers,
    ResumePayload, Status, VoiceStateUpdate,
};
pub use dispatch::{CacheOp, DispatchEvent, EntityEvent, MembersChunk, Ready};
pub use intents::Intents;
pub use opcodes::OpCode;
pub use payload::{GatewayEvent, OutboundFrame, RawPayload};
