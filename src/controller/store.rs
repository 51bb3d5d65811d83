//! Actor owning the only mutable `DeviceState`.
//!
//! All dispatches funnel through one bounded channel into a single task, so
//! `update` is never entered concurrently and actions apply in arrival order.
//! Each new state is published on a `watch` channel; effect batches go to the
//! executor over an unbounded channel so the store never waits on I/O.

use crate::controller::action::Action;
use crate::controller::effect::Effect;
use crate::controller::reducer::update;
use crate::controller::state::DeviceState;
use crate::error::{AppResult, RecorderError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of applying one action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// False when the action was an invalid transition (state and effects untouched)
    pub changed: bool,
    /// Number of effects handed to the executor
    pub effect_count: usize,
}

/// Message accepted by the store task.
#[derive(Debug)]
pub struct StoreMessage {
    action: Action,
    response: Option<oneshot::Sender<DispatchOutcome>>,
}

impl StoreMessage {
    /// Fire-and-forget dispatch.
    pub fn dispatch(action: Action) -> Self {
        Self {
            action,
            response: None,
        }
    }

    /// Dispatch that reports its outcome.
    pub fn dispatch_with_outcome(action: Action) -> (Self, oneshot::Receiver<DispatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                action,
                response: Some(tx),
            },
            rx,
        )
    }
}

/// Cloneable entry point to the store.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreMessage>,
    state_rx: watch::Receiver<DeviceState>,
}

impl StoreHandle {
    /// Queue an action.
    pub async fn dispatch(&self, action: Action) -> AppResult<()> {
        self.tx
            .send(StoreMessage::dispatch(action))
            .await
            .map_err(|_| RecorderError::ControllerClosed)
    }

    /// Queue an action and wait until it has been applied.
    pub async fn dispatch_with_outcome(&self, action: Action) -> AppResult<DispatchOutcome> {
        let (msg, rx) = StoreMessage::dispatch_with_outcome(action);
        self.tx
            .send(msg)
            .await
            .map_err(|_| RecorderError::ControllerClosed)?;
        rx.await.map_err(|_| RecorderError::ControllerClosed)
    }

    /// Queue an action from a plain OS thread (capture, writer).
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_dispatch(&self, action: Action) -> AppResult<()> {
        self.tx
            .blocking_send(StoreMessage::dispatch(action))
            .map_err(|_| RecorderError::ControllerClosed)
    }

    /// Snapshot of the latest published state.
    pub fn state(&self) -> DeviceState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state_rx.clone()
    }
}

struct Store {
    state: DeviceState,
    state_tx: watch::Sender<DeviceState>,
    effects_tx: mpsc::UnboundedSender<Vec<Effect>>,
}

impl Store {
    async fn run(mut self, mut rx: mpsc::Receiver<StoreMessage>) {
        info!("Store started");

        while let Some(StoreMessage { action, response }) = rx.recv().await {
            let name = action.name();
            let (next, effects) = update(&self.state, action);
            let state_changed = next != self.state;
            let outcome = DispatchOutcome {
                changed: state_changed || !effects.is_empty(),
                effect_count: effects.len(),
            };

            if outcome.changed {
                debug!(
                    action = name,
                    device_status = ?next.device_status,
                    recording_status = ?next.recording_status,
                    effects = effects.len(),
                    "Applied action"
                );
            } else {
                debug!(action = name, "Ignored action (invalid in current state)");
            }

            if state_changed {
                self.state = next;
                self.state_tx.send_replace(self.state.clone());
            }

            if !effects.is_empty() && self.effects_tx.send(effects).is_err() {
                warn!(action = name, "Effect executor is gone, dropping effects");
            }

            if let Some(response) = response {
                let _ = response.send(outcome);
            }
        }

        info!("Store stopped");
    }
}

/// Spawn the store task.
///
/// Returns the handle, the receiver of effect batches for the executor and the
/// task handle. The task ends once every `StoreHandle` has been dropped.
pub fn spawn_store(
    initial: DeviceState,
    capacity: usize,
) -> (
    StoreHandle,
    mpsc::UnboundedReceiver<Vec<Effect>>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (state_tx, state_rx) = watch::channel(initial.clone());
    let (effects_tx, effects_rx) = mpsc::unbounded_channel();

    let store = Store {
        state: initial,
        state_tx,
        effects_tx,
    };
    let task = tokio::spawn(store.run(rx));

    (StoreHandle { tx, state_rx }, effects_rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceKind, DeviceRef, DeviceStatus};

    #[tokio::test]
    async fn test_dispatch_updates_state_and_forwards_effects() {
        let (store, mut effects, _task) = spawn_store(DeviceState::new(), 8);
        let outcome = store
            .dispatch_with_outcome(Action::AssignDevice {
                device: DeviceRef::new(DeviceKind::Audio, 1),
                reply_to: None,
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome {
                changed: true,
                effect_count: 1
            }
        );
        assert_eq!(store.state().device_status, DeviceStatus::Assigning);
        let batch = effects.recv().await.unwrap();
        assert_eq!(
            batch,
            vec![Effect::ProbeDevice {
                device: DeviceRef::new(DeviceKind::Audio, 1),
                assignment: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_reports_unchanged() {
        let (store, mut effects, _task) = spawn_store(DeviceState::new(), 8);
        let outcome = store
            .dispatch_with_outcome(Action::StopRecording { reply_to: None })
            .await
            .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.effect_count, 0);
        assert!(effects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_is_serialized() {
        let (store, mut effects, _task) = spawn_store(DeviceState::new(), 2);
        let mut tasks = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .dispatch_with_outcome(Action::AssignDevice {
                        device: DeviceRef::new(DeviceKind::Camera, index),
                        reply_to: None,
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().changed {
                accepted += 1;
            }
        }
        // only the first AssignDevice is valid from Idle
        assert_eq!(accepted, 1);
        assert!(effects.recv().await.is_some());
        assert!(effects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (store, _effects, _task) = spawn_store(DeviceState::new(), 8);
        let mut rx = store.subscribe();
        store
            .dispatch(Action::Shutdown { reply_to: None })
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().shut_down);
    }
}
