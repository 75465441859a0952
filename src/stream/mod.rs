//! Stream session: wire frame decoding, the per-thread controller and the
//! driver loop that serializes its inputs.

pub mod controller;
pub mod driver;
pub mod errors;
pub mod frames;

pub use controller::{
    AgentRunSession, ControllerState, LiveToolCall, Notice, NoticeKind, SessionInput,
    SessionSnapshot, StreamSessionController,
};
pub use driver::{DriverHandle, SessionCommand, SessionDriver};
pub use errors::StreamError;
pub use frames::{decode_frame, is_policy_message, StreamEvent};
