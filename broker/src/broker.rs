// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The broker main loop: drives the downstream native compositor's session
//! lifecycle as an aggregate of all client session states, and runs one
//! `predict -> wait -> begin -> collect layers -> commit` cycle per
//! display period.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use monado_broker_types::{EventSink, PacerPoint};

use crate::config::Config;
use crate::gpu_wait::GpuWaiter;
use crate::native::{FrameData, NativeCompositor, NativeResourceBackend};
use crate::precise_sleep::Clock;
use crate::proxy::ClientProxy;
use crate::slot::EnvBlendMode;
use crate::state::BrokerState;

/// How long the main loop blocks on its condvar while idle, before
/// rechecking for new clients on its own. A real insert/remove always
/// wakes it immediately; this is just a backstop.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatedState {
    InitWarmStart,
    Stopped,
    Running,
    Stopping,
}

enum SideEffect {
    None,
    BeginSession,
    EndSession,
}

/// The transition table from §4.3 step 1, as pure data: `(prev, active>0)
/// -> (next, side effect)`. `Stopped` with no active clients is the only
/// case that doesn't run the rest of the cycle.
fn transition(prev: AggregatedState, active_count: u64) -> (AggregatedState, SideEffect, bool) {
    use AggregatedState::*;

    match (prev, active_count) {
        (InitWarmStart, _) => (Stopping, SideEffect::BeginSession, true),
        (Stopped, 0) => (Stopped, SideEffect::None, false),
        (Stopped, _) => (Running, SideEffect::BeginSession, true),
        (Running, 0) => (Stopping, SideEffect::None, true),
        (Running, _) => (Running, SideEffect::None, true),
        (Stopping, 0) => (Stopped, SideEffect::EndSession, true),
        (Stopping, _) => (Running, SideEffect::None, true),
    }
}

/// Whether a cycle ran a full predict/collect/commit pass, or found
/// nothing to do and returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    Ran,
}

pub struct Broker {
    cfg: Config,
    clock: Arc<dyn Clock>,
    gpu_waiter: Arc<dyn GpuWaiter>,
    resources: Arc<dyn NativeResourceBackend>,
    state: Mutex<BrokerState>,
    aggregated: Mutex<AggregatedState>,
    list_changed: Condvar,
}

impl Broker {
    pub fn new(
        cfg: Config,
        clock: Arc<dyn Clock>,
        gpu_waiter: Arc<dyn GpuWaiter>,
        resources: Arc<dyn NativeResourceBackend>,
    ) -> Self {
        let initial = if cfg.do_warm_start {
            AggregatedState::InitWarmStart
        } else {
            AggregatedState::Stopped
        };

        Self {
            cfg,
            clock,
            gpu_waiter,
            resources,
            state: Mutex::new(BrokerState::new()),
            aggregated: Mutex::new(initial),
            list_changed: Condvar::new(),
        }
    }

    pub fn aggregated_state(&self) -> AggregatedState {
        *self.aggregated.lock()
    }

    pub fn active_count(&self) -> u64 {
        self.state.lock().active_count()
    }

    /// Registers a new client and returns a handle to its proxy. The
    /// returned `Arc` is the same one held in the broker's table; dropping
    /// every other clone of it does not remove it from the table (call
    /// `remove_client` explicitly on disconnect).
    ///
    /// Fails with `BrokerError::TooManyClients` once the table already
    /// holds `cfg.max_clients` entries, per §3's bound on the client table.
    pub fn insert_client(
        &self,
        events: Box<dyn EventSink>,
        supports_multi_session: bool,
    ) -> Result<Arc<ClientProxy>, monado_broker_types::BrokerError> {
        let mut state = self.state.lock();
        if state.len() >= self.cfg.max_clients {
            return Err(monado_broker_types::BrokerError::TooManyClients(self.cfg.max_clients));
        }

        let id = state.reserve_client_id();
        let proxy = Arc::new(ClientProxy::new(
            id,
            self.cfg,
            self.clock.clone(),
            self.gpu_waiter.clone(),
            self.resources.clone(),
            events,
            supports_multi_session,
        ));
        state.insert(proxy.clone());
        drop(state);
        self.list_changed.notify_all();
        Ok(proxy)
    }

    pub fn remove_client(&self, client_id: u64) {
        let mut state = self.state.lock();
        if let Some(proxy) = state.remove(client_id) {
            drop(state);
            // `shutdown` also runs on `Drop`; calling it here just means
            // the wait worker stops before this function returns, rather
            // than whenever the last `Arc` happens to go away.
            proxy.shutdown();
            self.list_changed.notify_all();
        }
    }

    /// Broadcasts `SessionEvent::Lost` to every client and forces the
    /// aggregated state to `Stopped`, bypassing the normal transition
    /// table. For use when the native compositor is known to be gone.
    pub fn notify_fatal(&self) {
        let state = self.state.lock();
        for proxy in state.iter() {
            proxy.notify_lost();
        }
        drop(state);
        *self.aggregated.lock() = AggregatedState::Stopped;
    }

    /// Runs cycles until `shutdown` is set. Blocks on a condvar (with a
    /// backstop timeout) whenever a cycle reports `Idle`.
    pub fn run(&self, native: &mut dyn NativeCompositor, shutdown: &std::sync::atomic::AtomicBool) {
        use std::sync::atomic::Ordering;

        while !shutdown.load(Ordering::Relaxed) {
            match self.run_cycle(native) {
                Ok(CycleOutcome::Ran) => {}
                Ok(CycleOutcome::Idle) => {
                    let mut guard = self.state.lock();
                    self.list_changed.wait_for(&mut guard, IDLE_POLL_INTERVAL);
                }
                Err(err) => {
                    warn!(%err, "broker cycle failed");
                }
            }
        }
    }

    /// Runs exactly one cycle of §4.3. Pure with respect to wall-clock
    /// time (all timing goes through `self.clock`), so this is the unit
    /// tests' entry point.
    pub fn run_cycle(&self, native: &mut dyn NativeCompositor) -> anyhow::Result<CycleOutcome> {
        let active_count = self.state.lock().active_count();
        let prev = *self.aggregated.lock();
        let (next, side_effect, should_continue) = transition(prev, active_count);
        *self.aggregated.lock() = next;

        match side_effect {
            SideEffect::None => {}
            SideEffect::BeginSession => {
                if let Err(err) = native.begin_session() {
                    warn!(%err, "native begin_session failed");
                }
            }
            SideEffect::EndSession => {
                if let Err(err) = native.end_session() {
                    warn!(%err, "native end_session failed");
                }
            }
        }

        if !should_continue {
            return Ok(CycleOutcome::Idle);
        }

        let predicted = match native.predict_frame() {
            Ok(predicted) => predicted,
            Err(err) => {
                warn!(%err, "native predict_frame failed, skipping cycle");
                return Ok(CycleOutcome::Ran);
            }
        };

        {
            let state = self.state.lock();
            for proxy in state.iter() {
                proxy.set_next_display_time(predicted.predicted_display_ns);
            }
        }

        self.clock.sleep_until_ns(predicted.wake_ns);
        let wake_now_ns = self.clock.now_ns();
        native.mark_frame(PacerPoint::WakeUp, wake_now_ns);

        let margin_ns = predicted.predicted_display_ns.saturating_sub(wake_now_ns);
        {
            let state = self.state.lock();
            for proxy in state.iter() {
                proxy.broadcast_timing(predicted.predicted_display_ns, predicted.predicted_period_ns, margin_ns);
            }
        }

        if let Err(err) = native.begin_frame(predicted.frame_id) {
            warn!(%err, "native begin_frame failed, skipping cycle");
            return Ok(CycleOutcome::Ran);
        }
        if let Err(err) = native.layer_begin(FrameData {
            frame_id: predicted.frame_id,
            display_time_ns: predicted.predicted_display_ns,
            env_blend_mode: EnvBlendMode::Opaque,
        }) {
            warn!(%err, "native layer_begin failed, skipping cycle");
            return Ok(CycleOutcome::Ran);
        }

        let now_ns = self.clock.now_ns();
        let staged = {
            let state = self.state.lock();
            let mut staged: Vec<Arc<ClientProxy>> = Vec::new();

            for proxy in state.iter() {
                proxy.deliver_any_frames(predicted.predicted_display_ns, now_ns);

                if !proxy.has_delivered() {
                    continue;
                }

                if !proxy.visible() || !proxy.session_active() {
                    proxy.retire_delivered(now_ns);
                    continue;
                }

                proxy.latch_delivered(now_ns);
                staged.push(proxy.clone());
            }

            staged.sort_by_key(|proxy| proxy.z_order());

            for proxy in &staged {
                if let Err(err) = proxy.forward_delivered_layers(native) {
                    warn!(client_id = proxy.client_id, %err, "native compositor rejected a layer, skipping client for this cycle");
                }
            }

            staged
        };

        debug!(frame_id = predicted.frame_id, staged = staged.len(), "committing cycle");

        if let Err(err) = native.layer_commit(monado_broker_types::SyncHandle::Invalid) {
            warn!(%err, "native layer_commit failed");
        }

        Ok(CycleOutcome::Ran)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpu_wait::ImmediateGpuWaiter;
    use crate::native::{InMemoryResourceBackend, PredictedNativeFrame};
    use crate::precise_sleep::FakeClock;
    use monado_broker_types::{EyeVisibility, Layer, LayerData, LayerFlags, SwapchainRef, SyncHandle};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNative {
        begin_sessions: u32,
        end_sessions: u32,
        layer_swapchain_ids: Vec<u64>,
        frame_id: i64,
    }

    struct FakeNative(StdMutex<RecordingNative>);

    impl FakeNative {
        fn new() -> Self {
            Self(StdMutex::new(RecordingNative::default()))
        }
    }

    impl NativeCompositor for FakeNative {
        fn begin_session(&mut self) -> anyhow::Result<()> {
            self.0.lock().unwrap().begin_sessions += 1;
            Ok(())
        }
        fn end_session(&mut self) -> anyhow::Result<()> {
            self.0.lock().unwrap().end_sessions += 1;
            Ok(())
        }
        fn predict_frame(&mut self) -> anyhow::Result<PredictedNativeFrame> {
            let mut inner = self.0.lock().unwrap();
            inner.frame_id += 1;
            Ok(PredictedNativeFrame {
                frame_id: inner.frame_id,
                wake_ns: 5_000_000,
                predicted_display_ns: 16_000_000,
                predicted_period_ns: 16_000_000,
            })
        }
        fn mark_frame(&mut self, _point: PacerPoint, _when_ns: u64) {}
        fn begin_frame(&mut self, _frame_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
        fn layer_begin(&mut self, _frame_data: FrameData) -> anyhow::Result<()> {
            Ok(())
        }
        fn layer(&mut self, layer: &Layer) -> anyhow::Result<()> {
            if let Some(swapchain) = layer.swapchains().first() {
                self.0.lock().unwrap().layer_swapchain_ids.push(swapchain.id());
            }
            Ok(())
        }
        fn layer_commit(&mut self, _sync: SyncHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn quad(swapchain_id: u64) -> Layer {
        Layer {
            data: LayerData::Quad {
                swapchain: SwapchainRef::new(swapchain_id),
                size: monado_broker_types::Extent2D { width: 1.0, height: 1.0 },
            },
            pose: Default::default(),
            eye_visibility: EyeVisibility::Both,
            flags: LayerFlags::empty(),
            color_scale_bias: None,
            blend: None,
            depth_test: None,
            display_no_earlier_than_ns: 0,
        }
    }

    fn broker(do_warm_start: bool) -> Broker {
        let mut cfg = Config::default();
        cfg.do_warm_start = do_warm_start;
        Broker::new(
            cfg,
            Arc::new(FakeClock::new(0)),
            Arc::new(ImmediateGpuWaiter),
            Arc::new(InMemoryResourceBackend::new(90.0)),
        )
    }

    #[test]
    fn warm_start_with_no_clients_begins_then_ends_session_and_goes_idle() {
        let broker = broker(true);
        let mut native = FakeNative::new();

        assert_eq!(broker.run_cycle(&mut native).unwrap(), CycleOutcome::Ran);
        assert_eq!(broker.run_cycle(&mut native).unwrap(), CycleOutcome::Ran);
        assert_eq!(broker.run_cycle(&mut native).unwrap(), CycleOutcome::Idle);

        let inner = native.0.lock().unwrap();
        assert_eq!(inner.begin_sessions, 1);
        assert_eq!(inner.end_sessions, 1);
        assert_eq!(broker.active_count(), 0);
    }

    #[test]
    fn without_warm_start_broker_stays_idle_with_no_clients() {
        let broker = broker(false);
        let mut native = FakeNative::new();

        assert_eq!(broker.run_cycle(&mut native).unwrap(), CycleOutcome::Idle);
        assert_eq!(native.0.lock().unwrap().begin_sessions, 0);
    }

    #[test]
    fn two_clients_are_staged_in_zorder() {
        let broker = broker(false);
        let mut native = FakeNative::new();

        let (tx_a, _rx_a) = crossbeam_channel::unbounded();
        let (tx_b, _rx_b) = crossbeam_channel::unbounded();
        let a = broker.insert_client(Box::new(tx_a), true).unwrap();
        let b = broker.insert_client(Box::new(tx_b), true).unwrap();

        a.begin_session().unwrap();
        b.begin_session().unwrap();
        a.set_state(true, true);
        b.set_state(true, true);
        a.set_z_order(10);
        b.set_z_order(0);

        a.layer_begin(1, 16_000_000, EnvBlendMode::Opaque).unwrap();
        a.push_layer(quad(100)).unwrap();
        a.layer_commit(SyncHandle::Invalid, 0).unwrap();

        b.layer_begin(1, 16_000_000, EnvBlendMode::Opaque).unwrap();
        b.push_layer(quad(200)).unwrap();
        b.layer_commit(SyncHandle::Invalid, 0).unwrap();

        // Pick up scheduled -> deliver by running a cycle at the display time.
        broker.run_cycle(&mut native).unwrap();

        // b's z_order (0) sorts before a's (10), so its swapchain must be
        // forwarded to the native compositor first.
        assert_eq!(native.0.lock().unwrap().layer_swapchain_ids, vec![200, 100]);
    }

    #[test]
    fn invisible_client_is_retired_not_forwarded() {
        let broker = broker(false);
        let mut native = FakeNative::new();

        let (tx, _rx) = crossbeam_channel::unbounded();
        let client = broker.insert_client(Box::new(tx), true).unwrap();
        client.begin_session().unwrap();
        // left invisible: visible=false by default

        client.layer_begin(1, 16_000_000, EnvBlendMode::Opaque).unwrap();
        client.push_layer(quad(1)).unwrap();
        client.layer_commit(SyncHandle::Invalid, 0).unwrap();

        broker.run_cycle(&mut native).unwrap();

        assert!(!client.has_delivered());
        assert!(native.0.lock().unwrap().layer_swapchain_ids.is_empty());
    }

    #[test]
    fn insert_client_rejects_past_max_clients() {
        let mut cfg = Config::default();
        cfg.max_clients = 1;
        let broker = Broker::new(
            cfg,
            Arc::new(FakeClock::new(0)),
            Arc::new(ImmediateGpuWaiter),
            Arc::new(InMemoryResourceBackend::new(90.0)),
        );

        let (tx_a, _rx_a) = crossbeam_channel::unbounded();
        broker.insert_client(Box::new(tx_a), true).unwrap();

        let (tx_b, _rx_b) = crossbeam_channel::unbounded();
        assert!(matches!(
            broker.insert_client(Box::new(tx_b), true),
            Err(monado_broker_types::BrokerError::TooManyClients(1))
        ));
    }

    #[test]
    fn transition_table_matches_spec() {
        use AggregatedState::*;

        assert!(matches!(transition(InitWarmStart, 0), (Stopping, SideEffect::BeginSession, true)));
        assert!(matches!(transition(Stopped, 0), (Stopped, SideEffect::None, false)));
        assert!(matches!(transition(Stopped, 1), (Running, SideEffect::BeginSession, true)));
        assert!(matches!(transition(Running, 0), (Stopping, SideEffect::None, true)));
        assert!(matches!(transition(Running, 3), (Running, SideEffect::None, true)));
        assert!(matches!(transition(Stopping, 0), (Stopped, SideEffect::EndSession, true)));
        assert!(matches!(transition(Stopping, 2), (Running, SideEffect::None, true)));
    }
}
