//! Device controller: a pure reducer behind a single-owner store.
//!
//! ```text
//! Action --> Store --update(state, action)--> (state', [Effect]) --> EffectExecutor
//!   ^                                                                     |
//!   +----------------------- exactly one Action per Effect ---------------+
//! ```

pub mod action;
pub mod effect;
pub mod reducer;
pub mod state;
pub mod store;

pub use action::{Action, AssignmentId, CommandId};
pub use effect::{Effect, EffectKind, WriterSpec};
pub use reducer::update;
pub use state::{DeviceState, PendingReplies};
pub use store::{spawn_store, DispatchOutcome, StoreHandle, StoreMessage};
