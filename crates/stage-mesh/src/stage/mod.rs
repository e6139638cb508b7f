//! Stage orchestration: session lifecycle, state aggregation and UI events

mod event_loop;
pub mod events;
pub mod orchestrator;
pub mod state;

pub use events::{StageError, StageEvent};
pub use orchestrator::{SessionHook, StageOrchestrator, StageStats, MEDIA_DEVICE_CIRCUIT};
pub use state::{
    ConnectionStatus, Correction, MediaState, StageState, StatePatch, StateStore,
    MAX_RECENT_ERRORS,
};
