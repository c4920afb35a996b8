//! Progress event fan-out to subscribers (SSE/WebSocket bridges, CLI
//! watchers). Events are persisted before they are broadcast, so a
//! subscriber can always reconstruct what it missed.

pub mod progress;

pub use progress::{
    ProgressEvent, ProgressEventKind, ProgressPublisher, ProjectSnapshot, SceneSnapshot,
    Subscription,
};
