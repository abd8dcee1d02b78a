//! Notification types for the UI collaborator.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them verbatim (JSON lines, a webview event bus, ...).

pub mod events;
