//! Platform-neutral chat model: the inbound event stream and the outbound RPC port.

pub mod port;
pub mod types;

pub use port::ChatPort;
pub use types::{Author, ChannelInfo, ChatEvent, ChatMessage, MemberInfo};
