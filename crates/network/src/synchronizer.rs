use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{NetError, NetResult};

struct SyncState {
    events: usize,
    required: usize,
    clear_errors: bool,
    done: Option<oneshot::Sender<NetResult<()>>>,
}

/// Counts completion events toward a required total and resolves a final
/// receiver exactly once. With `clear_errors` false the first error resolves
/// immediately; with it true errors count as ordinary events (the caller
/// judges overall success by other means). Idempotent past the threshold.
pub struct Synchronizer {
    name: &'static str,
    state: Mutex<SyncState>,
}

impl Synchronizer {
    pub fn new(
        required: usize,
        name: &'static str,
        clear_errors: bool,
    ) -> (Arc<Self>, oneshot::Receiver<NetResult<()>>) {
        let (done, receiver) = oneshot::channel();
        let synchronizer = Arc::new(Self {
            name,
            state: Mutex::new(SyncState {
                events: 0,
                required,
                clear_errors,
                done: Some(done),
            }),
        });
        if required == 0 {
            synchronizer.fire(Ok(()));
        }
        (synchronizer, receiver)
    }

    pub fn set_event(&self, result: NetResult<()>) {
        let mut fire: Option<NetResult<()>> = None;
        if let Ok(mut state) = self.state.lock() {
            if state.done.is_none() {
                return;
            }
            match result {
                Err(ec) if !state.clear_errors => fire = Some(Err(ec)),
                _ => {
                    state.events += 1;
                    trace!(
                        name = self.name,
                        events = state.events,
                        required = state.required,
                        "synchronizer event"
                    );
                    if state.events >= state.required {
                        fire = Some(Ok(()));
                    }
                }
            }
        }
        if let Some(result) = fire {
            self.fire(result);
        }
    }

    fn fire(&self, result: NetResult<()>) {
        let done = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.done.take());
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

/// Convenience for waiting on the final receiver; a dropped synchronizer
/// resolves as `OperationFailed`.
pub async fn await_final(receiver: oneshot::Receiver<NetResult<()>>) -> NetResult<()> {
    match receiver.await {
        Ok(result) => result,
        Err(_) => Err(NetError::OperationFailed),
    }
}
