pub mod message;
pub mod render;

pub use message::{
    Message, MessageId, MessageStatus, Role, StreamState, StreamTransition,
    StreamTransitionRejection,
};
pub use render::{ChatRenderer, FAILURE_NOTICE, RenderedRow};
