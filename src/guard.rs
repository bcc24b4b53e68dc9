//! Process-wide critical section delaying shutdown behind in-flight work.
//!
//! Every pipeline execution enters the section for its whole lifetime. A
//! host that wants to shut down cleanly calls [`wait_for_idle`], which
//! flips the gate into the exiting state and parks until the count reaches
//! zero. Once exiting, [`enter`] parks forever so shutdown can proceed
//! unobstructed, and [`try_enter`] returns `None`; cancellation of a parked
//! `enter` future is the caller's escape hatch.

use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

struct GateState {
    active: usize,
    exiting: bool,
}

pub(crate) struct Gate {
    state: Mutex<GateState>,
    idle: Notify,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                active: 0,
                exiting: false,
            }),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&'static self) -> SectionGuard {
        let exiting = {
            let mut st = self.lock();
            if st.exiting {
                true
            } else {
                st.active += 1;
                false
            }
        };
        if exiting {
            debug!("shutdown in progress, parking new critical-section entrant");
            std::future::pending::<()>().await;
        }
        SectionGuard {
            gate: self,
            closed: false,
        }
    }

    fn try_enter(&'static self) -> Option<SectionGuard> {
        let mut st = self.lock();
        if st.exiting {
            return None;
        }
        st.active += 1;
        Some(SectionGuard {
            gate: self,
            closed: false,
        })
    }

    async fn wait_for_idle(&'static self) {
        {
            let mut st = self.lock();
            st.exiting = true;
            if st.active == 0 {
                return;
            }
        }
        loop {
            // Register for notification before re-checking so a release
            // between the check and the await is not missed.
            let notified = self.idle.notified();
            {
                let st = self.lock();
                if st.active == 0 {
                    return;
                }
                debug!(active = st.active, "waiting for in-flight pipelines");
            }
            notified.await;
        }
    }

    fn release(&self) {
        let mut st = self.lock();
        st.active = st.active.saturating_sub(1);
        if st.active == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// RAII handle of one critical-section entry. [`close`](Self::close) (or
/// drop) releases it; releasing twice has the effect of releasing once.
pub struct SectionGuard {
    gate: &'static Gate,
    closed: bool,
}

impl SectionGuard {
    /// Release the critical section explicitly.
    pub fn close(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.closed {
            self.closed = true;
            self.gate.release();
        }
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

fn gate() -> &'static Gate {
    static GATE: OnceLock<Gate> = OnceLock::new();
    GATE.get_or_init(Gate::new)
}

/// Enter the process-wide critical section. Parks forever when shutdown is
/// already in progress; drop the future to give up.
pub async fn enter() -> SectionGuard {
    gate().enter().await
}

/// Enter the critical section unless shutdown is in progress.
pub fn try_enter() -> Option<SectionGuard> {
    gate().try_enter()
}

/// Flip into the exiting state and wait until every in-flight pipeline has
/// settled. Intended to be called from the host's shutdown path.
pub async fn wait_for_idle() {
    gate().wait_for_idle().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_gate() -> &'static Gate {
        Box::leak(Box::new(Gate::new()))
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let gate = fresh_gate();
        let a = gate.enter().await;
        let b = gate.enter().await;
        a.close();
        drop(b);
        // Both guards released exactly once each: idle completes.
        gate.wait_for_idle().await;
    }

    #[tokio::test]
    async fn test_wait_for_idle_blocks_until_release() {
        let gate = fresh_gate();
        let guard = gate.enter().await;

        let waiter = tokio::spawn(gate.wait_for_idle());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        guard.close();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_try_enter_refused_while_exiting() {
        let gate = fresh_gate();
        gate.wait_for_idle().await;
        assert!(gate.try_enter().is_none());
    }

    #[tokio::test]
    async fn test_enter_parks_while_exiting() {
        let gate = fresh_gate();
        gate.wait_for_idle().await;
        let parked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gate.enter(),
        )
        .await;
        assert!(parked.is_err(), "enter must park once exiting");
    }
}
