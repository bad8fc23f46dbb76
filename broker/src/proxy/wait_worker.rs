// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The per-client wait worker: a dedicated thread that blocks on a client's
//! GPU fence or semaphore so neither the client's own submission thread nor
//! the broker's main loop ever has to. Retries on a plain timeout; gives up
//! and proceeds anyway if the underlying wait reports a hard failure, since
//! a stuck client shouldn't be able to wedge the whole pipeline.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use monado_broker_types::{PacerPoint, SyncHandle};

use super::Shared;
use crate::slot::FRAME_ID_INACTIVE;

pub(crate) struct WorkerHandoff {
    pub sync: SyncHandle,
    pub frame_id: i64,
}

struct Inner {
    pending: Option<WorkerHandoff>,
    waiting: bool,
    blocked_client: bool,
    alive: bool,
}

/// The handoff point between a client thread calling `layer_commit` with a
/// real fence/semaphore and this module's worker thread. Also the thing
/// `layer_begin` blocks on, to cap in-flight submissions at one.
pub(crate) struct WaitThreadState {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl WaitThreadState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: None,
                waiting: false,
                blocked_client: false,
                alive: true,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn hand_off(&self, handoff: WorkerHandoff) {
        let mut inner = self.inner.lock();
        inner.pending = Some(handoff);
        drop(inner);
        self.condvar.notify_all();
    }

    /// Blocks the calling (client) thread until the worker is neither
    /// holding an unconsumed handoff nor actively waiting on one.
    pub fn block_until_idle(&self) {
        let mut inner = self.inner.lock();
        inner.blocked_client = true;
        while inner.pending.is_some() || inner.waiting {
            self.condvar.wait(&mut inner);
        }
        inner.blocked_client = false;
    }

    pub fn shut_down(&self) {
        let mut inner = self.inner.lock();
        inner.alive = false;
        drop(inner);
        self.condvar.notify_all();
    }
}

/// Runs on the worker thread for the lifetime of the client proxy.
pub(crate) fn run(shared: std::sync::Arc<Shared>) {
    loop {
        let handoff = {
            let mut inner = shared.wait_thread.inner.lock();
            loop {
                if !inner.alive {
                    return;
                }
                if let Some(handoff) = inner.pending.take() {
                    inner.waiting = true;
                    break handoff;
                }
                shared.wait_thread.condvar.wait(&mut inner);
            }
        };

        let mut done = false;
        while !done {
            match shared.gpu_waiter.wait(&handoff.sync, shared.cfg.fence_wait_timeout) {
                Ok(true) => done = true,
                Ok(false) => {
                    tracing::debug!(frame_id = handoff.frame_id, "gpu wait timed out, retrying");
                }
                Err(err) => {
                    tracing::warn!(
                        frame_id = handoff.frame_id,
                        %err,
                        "gpu wait reported a failure, proceeding as if it completed",
                    );
                    done = true;
                }
            }

            if !shared.wait_thread.inner.lock().alive {
                return;
            }
        }

        schedule_from_progress(&shared, handoff.frame_id);

        let mut inner = shared.wait_thread.inner.lock();
        inner.waiting = false;
        drop(inner);
        shared.wait_thread.condvar.notify_all();
    }
}

/// The progress -> scheduled pickup rule, shared between the worker thread
/// (real fence/semaphore) and `layer_commit`'s inline path (no sync
/// handle). Displaces whatever's in `scheduled` if it's within half a
/// display period of the broker's next announced display time, or if that
/// display time has already passed; otherwise spins until one becomes
/// true.
pub(crate) fn schedule_from_progress(shared: &Shared, frame_id: i64) {
    let now_ns = shared.clock.now_ns();
    shared.pacer.lock().mark_point(frame_id, PacerPoint::GpuDone, now_ns);

    let mut progress = shared.progress.lock();
    if progress.frame_id() != frame_id {
        // The frame was discarded (or never matched) before the GPU
        // finished with it; `discard_frame` already reset `submit` to
        // `Idle`, so there's nothing left to schedule or reset here.
        return;
    }
    let incoming = progress.take();
    drop(progress);

    // The frame is fully committed now, whether it lands in `scheduled`
    // directly or has to displace something below -- either way
    // `layer_begin` should be allowed to open the next one.
    *shared.submit.lock() = super::SubmitState::Idle;

    loop {
        let mut slot = shared.slot.lock();
        let now = shared.clock.now_ns();

        if !slot.scheduled.is_active() {
            slot.scheduled = incoming;
            return;
        }

        let period_ns = shared.pacer.lock().period_ns();
        let half_window = shared.cfg.half_window_ns(period_ns);
        let incoming_display_ns = incoming.display_ns().unwrap_or(0);
        let within_window = incoming_display_ns.abs_diff(slot.next_display_time_ns) <= half_window;
        let already_passed = slot
            .scheduled
            .display_ns()
            .map(|display_ns| display_ns < now)
            .unwrap_or(false);

        if within_window || already_passed {
            let mut displaced = std::mem::replace(&mut slot.scheduled, incoming);
            if let Some(meta) = displaced.metadata() {
                shared.pacer.lock().mark_point(meta.frame_id, PacerPoint::Retired, now);
            }
            displaced.clear();
            return;
        }

        drop(slot);
        shared.clock.sleep(shared.cfg.pickup_spin_interval);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::gpu_wait::ImmediateGpuWaiter;
    use crate::native::InMemoryResourceBackend;
    use crate::precise_sleep::FakeClock;
    use crate::slot::{EnvBlendMode, FrameMetadata};
    use monado_broker_types::EventSink;
    use std::sync::Arc;

    struct NullSink;
    impl EventSink for NullSink {
        fn push(&self, _event: monado_broker_types::SessionEvent) {}
    }

    fn shared(clock: FakeClock) -> Arc<Shared> {
        Arc::new(Shared {
            cfg: Config::default(),
            clock: Arc::new(clock),
            gpu_waiter: Arc::new(ImmediateGpuWaiter),
            resources: Arc::new(InMemoryResourceBackend::new(90.0)),
            events: Box::new(NullSink),
            supports_multi_session: true,
            state: Mutex::new(super::super::ProxyState {
                visible: false,
                focused: false,
                overlay_visible: false,
                z_order: 0,
                session_active: false,
            }),
            progress: Mutex::new(crate::slot::FrameLayerSlot::inactive()),
            slot: Mutex::new(super::super::SlotGroup {
                scheduled: crate::slot::FrameLayerSlot::inactive(),
                next_display_time_ns: 16_000_000,
            }),
            delivered: Mutex::new(crate::slot::FrameLayerSlot::inactive()),
            submit: Mutex::new(super::super::SubmitState::Idle),
            current_frame: Mutex::new(None),
            pacer: Mutex::new(crate::pacer::Pacer::new()),
            wait_thread: WaitThreadState::new(),
        })
    }

    #[test]
    fn schedule_from_progress_fills_an_empty_scheduled_slot() {
        let clock = FakeClock::new(0);
        let shared = shared(clock);

        shared.progress.lock().activate(FrameMetadata {
            frame_id: 1,
            predicted_display_ns: 16_000_000,
            env_blend_mode: EnvBlendMode::Opaque,
        });

        schedule_from_progress(&shared, 1);

        assert_eq!(shared.slot.lock().scheduled.frame_id(), 1);
        assert!(!shared.progress.lock().is_active());
    }

    #[test]
    fn schedule_from_progress_ignores_a_stale_frame_id() {
        let clock = FakeClock::new(0);
        let shared = shared(clock);

        shared.progress.lock().activate(FrameMetadata {
            frame_id: 2,
            predicted_display_ns: 16_000_000,
            env_blend_mode: EnvBlendMode::Opaque,
        });

        // Frame 1 was superseded by frame 2 before its GPU_DONE callback
        // landed; it must not clobber the newer frame.
        schedule_from_progress(&shared, 1);

        assert_eq!(shared.slot.lock().scheduled.frame_id(), FRAME_ID_INACTIVE);
        assert_eq!(shared.progress.lock().frame_id(), 2);
    }

    #[test]
    fn schedule_from_progress_displaces_within_half_window() {
        let clock = FakeClock::new(0);
        let shared = shared(clock);
        shared.pacer.lock().info(16_000_000, 16_000_000, 0);

        shared.slot.lock().scheduled.activate(FrameMetadata {
            frame_id: 1,
            predicted_display_ns: 16_000_000,
            env_blend_mode: EnvBlendMode::Opaque,
        });

        shared.progress.lock().activate(FrameMetadata {
            frame_id: 2,
            predicted_display_ns: 16_000_000,
            env_blend_mode: EnvBlendMode::Opaque,
        });

        schedule_from_progress(&shared, 2);

        assert_eq!(shared.slot.lock().scheduled.frame_id(), 2);
    }

    #[test]
    fn block_until_idle_returns_immediately_when_worker_is_quiet() {
        let state = WaitThreadState::new();
        state.block_until_idle();
    }
}
