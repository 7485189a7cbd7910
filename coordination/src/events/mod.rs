//! Progress reporting for orchestrated requests
//!
//! Three pieces:
//!
//! 1. **Event Types** (`types.rs`): [`ProgressEvent`] and its [`Phase`].
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast pub/sub; publishing never
//!    blocks the request.
//! 3. **Progress Tracker** (`progress.rs`): per-request accumulator that
//!    keeps the percentage monotonic and forwards to the bus.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Orchestrator │────▶│  Tracker     │────▶│  Event Bus   │────▶ subscribers
//! │  (emit)      │     │ (monotonic)  │     │ (broadcast)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod progress;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use progress::{task_percent, ProgressTracker};
pub use types::{Phase, ProgressEvent, REQUEST_SCOPE};
