#![deny(unsafe_code)]

/// Local attachment loading.
pub mod attach;
/// Speech and clipboard capabilities supplied by the host.
pub mod capability;
/// Transcript model and streaming renderer.
pub mod chat;
/// Session lifecycle and stream orchestration.
pub mod controller;
pub mod export;
pub mod logging;
/// Terminal command parsing and rendering.
pub mod repl;
/// Layered settings persistence.
pub mod settings;

pub use controller::{
    ControllerEvent, ControllerOptions, LoadGeneration, Notice, Phase, SessionController,
    SubmitOutcome,
};
pub use settings::{Settings, SettingsStore};
