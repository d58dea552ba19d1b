//! Per-frame timing checkpoints and rolling frame statistics.
//!
//! `render()` returns an explicit ordered list of named stage spans instead of
//! firing callbacks between stages; the scheduler folds those spans into a
//! [`FrameStats`] snapshot once per rolling one-second window.

use std::time::{Duration, Instant};

use smallvec::SmallVec;

/// Named pipeline stage boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageLabel {
    /// Source resize + engine input write.
    Resize,
    /// External inference call.
    Inference,
    /// Mask decode, edge refinement and background composition.
    Composition,
}

/// Duration of one named stage within a frame.
#[derive(Clone, Copy, Debug)]
pub struct StageSpan {
    pub label: StageLabel,
    pub duration: Duration,
}

/// Ordered stage spans for one rendered frame.
#[derive(Clone, Debug, Default)]
pub struct FrameTimings {
    /// Spans in execution order. The boundaries between consecutive spans are
    /// the frame's interior checkpoints.
    pub spans: SmallVec<[StageSpan; 4]>,
    /// Wall time of the whole `render()` call.
    pub total: Duration,
}

impl FrameTimings {
    /// Number of interior stage boundaries (checkpoints recorded before the
    /// final stage completes).
    pub fn interior_checkpoints(&self) -> usize {
        self.spans.len().saturating_sub(1)
    }
}

/// Records stage spans while a frame renders.
pub struct FrameTimer {
    frame_start: Instant,
    span_start: Instant,
    spans: SmallVec<[StageSpan; 4]>,
}

impl FrameTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            frame_start: now,
            span_start: now,
            spans: SmallVec::new(),
        }
    }

    /// Close the current span under `label` and open the next one.
    pub fn checkpoint(&mut self, label: StageLabel) {
        let now = Instant::now();
        self.spans.push(StageSpan {
            label,
            duration: now - self.span_start,
        });
        self.span_start = now;
    }

    /// Close the final span and return the frame's timings.
    pub fn finish(mut self, label: StageLabel) -> FrameTimings {
        let now = Instant::now();
        self.spans.push(StageSpan {
            label,
            duration: now - self.span_start,
        });
        FrameTimings {
            spans: self.spans,
            total: now - self.frame_start,
        }
    }
}

/// Telemetry snapshot emitted at ~1 Hz.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FrameStats {
    /// Frames per second over the last window.
    pub fps: f32,
    /// Most recent frame's per-stage durations, in milliseconds, in execution
    /// order.
    pub stage_durations: Vec<(StageLabel, f32)>,
}

/// Rolling one-second aggregation window.
pub struct StatsWindow {
    window_start: Instant,
    frame_count: u32,
    last_spans: Vec<(StageLabel, f32)>,
}

impl StatsWindow {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frame_count: 0,
            last_spans: Vec::new(),
        }
    }

    /// Record one frame. Returns a stats snapshot when the one-second window
    /// rolls over.
    pub fn record(&mut self, timings: &FrameTimings) -> Option<FrameStats> {
        self.frame_count += 1;
        self.last_spans = timings
            .spans
            .iter()
            .map(|s| (s.label, s.duration.as_secs_f32() * 1000.0))
            .collect();

        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed.as_secs_f32();
        self.window_start = Instant::now();
        self.frame_count = 0;
        Some(FrameStats {
            fps,
            stage_durations: self.last_spans.clone(),
        })
    }
}

impl Default for StatsWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_produces_ordered_spans() {
        let mut timer = FrameTimer::start();
        timer.checkpoint(StageLabel::Resize);
        timer.checkpoint(StageLabel::Inference);
        let timings = timer.finish(StageLabel::Composition);

        let labels: Vec<_> = timings.spans.iter().map(|s| s.label).collect();
        assert_eq!(
            labels,
            vec![
                StageLabel::Resize,
                StageLabel::Inference,
                StageLabel::Composition
            ]
        );
        assert_eq!(timings.interior_checkpoints(), 2);
        let span_sum: Duration = timings.spans.iter().map(|s| s.duration).sum();
        assert!(timings.total >= span_sum);
    }

    #[test]
    fn stats_window_emits_after_one_second() {
        let mut window = StatsWindow::new();
        // Backdate the window start so the next record rolls it over.
        window.window_start = Instant::now() - Duration::from_millis(1100);
        window.frame_count = 32;

        let mut timer = FrameTimer::start();
        timer.checkpoint(StageLabel::Resize);
        timer.checkpoint(StageLabel::Inference);
        let timings = timer.finish(StageLabel::Composition);

        let stats = window.record(&timings).expect("window should roll over");
        assert!(stats.fps > 0.0);
        assert_eq!(stats.stage_durations.len(), 3);
        assert_eq!(window.frame_count, 0);
    }
}
