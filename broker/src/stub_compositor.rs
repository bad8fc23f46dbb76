// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A placeholder `NativeCompositor` for the standalone binary: paces
//! itself with the same `Pacer` used for per-client proxies and logs
//! everything it's told, but never scans anything out to a real display.
//! A real deployment links the broker library against an actual display
//! backend instead of this binary.

use tracing::trace;

use monado_broker::native::{FrameData, NativeCompositor, PredictedNativeFrame};
use monado_broker::pacer::Pacer;
use monado_broker::precise_sleep::now_ns;
use monado_broker_types::{Layer, PacerPoint, SyncHandle};

pub struct StubNativeCompositor {
    pacer: Pacer,
    current_frame_id: i64,
}

impl StubNativeCompositor {
    pub fn new() -> Self {
        Self {
            pacer: Pacer::new(),
            current_frame_id: 0,
        }
    }
}

impl NativeCompositor for StubNativeCompositor {
    fn begin_session(&mut self) -> anyhow::Result<()> {
        trace!("native begin_session");
        Ok(())
    }

    fn end_session(&mut self) -> anyhow::Result<()> {
        trace!("native end_session");
        Ok(())
    }

    fn predict_frame(&mut self) -> anyhow::Result<PredictedNativeFrame> {
        let predicted = self.pacer.predict(now_ns());
        self.current_frame_id = predicted.frame_id;

        Ok(PredictedNativeFrame {
            frame_id: predicted.frame_id,
            wake_ns: predicted.wake_ns,
            predicted_display_ns: predicted.predicted_display_ns,
            predicted_period_ns: predicted.predicted_period_ns,
        })
    }

    fn mark_frame(&mut self, point: PacerPoint, when_ns: u64) {
        self.pacer.mark_point(self.current_frame_id, point, when_ns);
    }

    fn begin_frame(&mut self, frame_id: i64) -> anyhow::Result<()> {
        trace!(frame_id, "native begin_frame");
        Ok(())
    }

    fn layer_begin(&mut self, frame_data: FrameData) -> anyhow::Result<()> {
        trace!(frame_id = frame_data.frame_id, "native layer_begin");
        Ok(())
    }

    fn layer(&mut self, layer: &Layer) -> anyhow::Result<()> {
        trace!(layer_type = ?layer.layer_type(), "native layer");
        Ok(())
    }

    fn layer_commit(&mut self, sync: SyncHandle) -> anyhow::Result<()> {
        trace!(valid = sync.is_valid(), "native layer_commit");
        Ok(())
    }
}
