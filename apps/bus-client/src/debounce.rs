//! Leading+trailing debounce for async jobs.
//!
//! The first call in a quiet period runs immediately and opens a window.
//! Calls arriving while the window is open collapse into one trailing run at
//! the end of the window; every one of those callers receives the result of
//! that run. Jobs are expected to read current state when they execute, so
//! only the first job queued for a trailing run is kept.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::{self, Instant};

use crate::error::{BusError, Result};

type PendingRun = Shared<BoxFuture<'static, Result<()>>>;

#[derive(Default)]
struct DebounceState {
    window_ends: Option<Instant>,
    trailing: Option<PendingRun>,
}

enum Run<F> {
    Now(F),
    Wait(PendingRun),
}

pub struct Debouncer {
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub async fn call<F, Fut>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let now = Instant::now();
        let run = {
            let mut state = self.state.lock();
            match state.window_ends.filter(|ends| *ends > now) {
                None => {
                    state.window_ends = Some(now + self.window);
                    Run::Now(job)
                }
                Some(ends) => match state.trailing.clone() {
                    Some(pending) => Run::Wait(pending),
                    None => {
                        let pending = self.schedule(ends, job);
                        state.trailing = Some(pending.clone());
                        Run::Wait(pending)
                    }
                },
            }
        };
        match run {
            Run::Now(job) => job().await,
            Run::Wait(pending) => pending.await,
        }
    }

    fn schedule<F, Fut>(&self, at: Instant, job: F) -> PendingRun
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let state = self.state.clone();
        let window = self.window;
        // Spawned so the trailing run happens even if every caller stops
        // polling.
        let handle = tokio::spawn(async move {
            time::sleep_until(at).await;
            {
                let mut state = state.lock();
                state.window_ends = Some(Instant::now() + window);
                state.trailing = None;
            }
            job().await
        });
        async move {
            handle
                .await
                .map_err(|err| BusError::internal(format!("debounced job failed: {err}")))?
        }
        .boxed()
        .shared()
    }
}
