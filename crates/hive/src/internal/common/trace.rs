use std::time::Instant;

/// Reports how long a block of engine code took, once the guard is dropped.
pub struct ScopedTimer {
    component: &'static str,
    operation: &'static str,
    started: Instant,
}

impl ScopedTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            started: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        tracing::debug!(
            component = self.component,
            operation = self.operation,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "measured"
        );
    }
}

macro_rules! trace_time {
    ($component:literal, $operation:literal, $block:expr) => {{
        let _timer = $crate::internal::common::trace::ScopedTimer::new($component, $operation);
        $block
    }};
}
