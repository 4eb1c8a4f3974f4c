//! Caller-supplied progress and preview sinks.
//!
//! Sinks are borrowed for the duration of one call and invoked
//! synchronously on the calling thread. Absent sinks are never invoked.

/// Progress sink wrapper: clamps to `[0, 1]` and drops regressions so the
/// caller observes a non-decreasing sequence.
pub struct ProgressReporter<'a> {
    sink: Option<&'a mut dyn FnMut(f32)>,
    last: f32,
    calls: usize,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: Option<&'a mut dyn FnMut(f32)>) -> Self {
        Self {
            sink,
            last: 0.0,
            calls: 0,
        }
    }

    pub fn silent() -> Self {
        Self::new(None)
    }

    pub fn report(&mut self, value: f32) {
        let value = if value.is_nan() {
            self.last
        } else {
            value.clamp(0.0, 1.0)
        };
        if self.calls > 0 && value < self.last {
            return;
        }
        self.last = value;
        self.calls += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink(value);
        }
    }

    /// Last value delivered (0.0 before the first report).
    pub fn last(&self) -> f32 {
        self.last
    }

    /// Report through a sub-range: `value` in `[0, 1]` is mapped onto
    /// `[start, end]`.
    pub fn report_within(&mut self, start: f32, end: f32, value: f32) {
        self.report(start + (end - start) * value.clamp(0.0, 1.0));
    }
}

/// Preview sink: interleaved RGBA8 raster, width, height.
pub type PreviewSink<'a> = &'a mut dyn FnMut(&[u8], u32, u32);

/// Both sinks for one processing call.
pub struct Callbacks<'a> {
    progress: ProgressReporter<'a>,
    preview: Option<PreviewSink<'a>>,
    previewed: Vec<&'static str>,
}

impl<'a> Callbacks<'a> {
    pub fn none() -> Self {
        Self {
            progress: ProgressReporter::silent(),
            preview: None,
            previewed: Vec::new(),
        }
    }

    pub fn with_progress(mut self, sink: &'a mut dyn FnMut(f32)) -> Self {
        self.progress = ProgressReporter::new(Some(sink));
        self
    }

    pub fn with_preview(mut self, sink: PreviewSink<'a>) -> Self {
        self.preview = Some(sink);
        self
    }

    #[inline]
    pub fn progress(&mut self, value: f32) {
        self.progress.report(value);
    }

    pub fn reporter(&mut self) -> &mut ProgressReporter<'a> {
        &mut self.progress
    }

    /// Whether a preview for `stage` would reach a sink.
    pub fn wants_preview(&self, stage: &'static str) -> bool {
        self.preview.is_some() && !self.previewed.contains(&stage)
    }

    /// Deliver a preview raster, at most once per stage.
    pub fn preview(&mut self, stage: &'static str, rgba: &[u8], width: u32, height: u32) {
        if !self.wants_preview(stage) {
            return;
        }
        self.previewed.push(stage);
        if let Some(sink) = self.preview.as_mut() {
            sink(rgba, width, height);
        }
    }
}

impl Default for Callbacks<'_> {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut seen = Vec::new();
        {
            let mut sink = |v: f32| seen.push(v);
            let mut reporter = ProgressReporter::new(Some(&mut sink));
            reporter.report(-0.5);
            reporter.report(0.4);
            reporter.report(0.2);
            reporter.report(f32::NAN);
            reporter.report(1.7);
        }
        assert_eq!(seen, vec![0.0, 0.4, 0.4, 1.0]);
    }

    #[test]
    fn sub_range_reports_map_onto_window() {
        let mut seen = Vec::new();
        {
            let mut sink = |v: f32| seen.push(v);
            let mut reporter = ProgressReporter::new(Some(&mut sink));
            reporter.report_within(0.4, 0.8, 0.5);
            reporter.report_within(0.4, 0.8, 1.0);
        }
        assert!((seen[0] - 0.6).abs() < 1e-6);
        assert!((seen[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn preview_fires_once_per_stage() {
        let mut frames = Vec::new();
        {
            let mut sink = |buf: &[u8], w: u32, h: u32| frames.push((buf.len(), w, h));
            let mut cbs = Callbacks::none().with_preview(&mut sink);
            cbs.preview("resize", &[0; 16], 2, 2);
            cbs.preview("resize", &[0; 16], 2, 2);
            cbs.preview("compress", &[0; 4], 1, 1);
        }
        assert_eq!(frames, vec![(16, 2, 2), (4, 1, 1)]);
    }

    #[test]
    fn absent_sinks_are_not_invoked() {
        let mut cbs = Callbacks::none();
        assert!(!cbs.wants_preview("decode"));
        cbs.progress(0.5);
        cbs.preview("decode", &[1, 2, 3, 4], 1, 1);
    }
}
