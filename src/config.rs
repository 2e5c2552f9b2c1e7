//! Runtime configuration.
//!
//! A [`Config`] is handed to [`Runtime::with_config`](crate::Runtime::with_config)
//! and shared by every instance the runtime creates.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// Reported to [`Config::on_hot_loop`] every `loop_report_stride` back edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    /// Function index of the running loop.
    pub func: u32,
    /// Bytecode offset of the loop head.
    pub offset: u32,
    /// Back edges taken by the current activation so far.
    pub iterations: u64,
}

pub type HotLoopHook = Arc<dyn Fn(&LoopReport) + Send + Sync>;

/// Resource limits and instrumentation switches.
#[derive(Clone)]
pub struct Config {
    pub(crate) max_call_depth: usize,
    pub(crate) max_stack_slots: usize,
    pub(crate) max_memory_pages: u64,
    pub(crate) max_table_elements: u32,
    pub(crate) loop_report_stride: u64,
    pub(crate) branch_profiling: bool,
    pub(crate) on_hot_loop: Option<HotLoopHook>,
}

impl Config {
    pub fn new() -> Self {
        Config {
            max_call_depth: 16_384,
            max_stack_slots: 4 << 20,
            max_memory_pages: 65_536,
            max_table_elements: 10_000_000,
            loop_report_stride: 256,
            branch_profiling: false,
            on_hot_loop: None,
        }
    }

    /// Defaults overlaid with `RIPTIDE_MAX_CALL_DEPTH`, `RIPTIDE_MAX_STACK_SLOTS`
    /// and `RIPTIDE_BRANCH_PROFILING` when set.
    pub fn from_env() -> Self {
        let mut config = Config::new();
        if let Some(depth) = env_parse::<usize>("RIPTIDE_MAX_CALL_DEPTH") {
            config.max_call_depth = depth;
        }
        if let Some(slots) = env_parse::<usize>("RIPTIDE_MAX_STACK_SLOTS") {
            config.max_stack_slots = slots;
        }
        if let Ok(v) = std::env::var("RIPTIDE_BRANCH_PROFILING") {
            config.branch_profiling = matches!(v.as_str(), "1" | "true" | "on");
        }
        debug!(
            max_call_depth = config.max_call_depth,
            max_stack_slots = config.max_stack_slots,
            branch_profiling = config.branch_profiling,
            "config loaded from environment"
        );
        config
    }

    /// Maximum number of nested activations before `CallStackExhausted`.
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth.max(1);
        self
    }

    /// Maximum operand-stack slots (locals included) across all frames.
    pub fn max_stack_slots(mut self, slots: usize) -> Self {
        self.max_stack_slots = slots;
        self
    }

    /// Upper bound on any memory's page count, on top of its declared maximum.
    pub fn max_memory_pages(mut self, pages: u64) -> Self {
        self.max_memory_pages = pages;
        self
    }

    pub fn max_table_elements(mut self, n: u32) -> Self {
        self.max_table_elements = n;
        self
    }

    /// Back edges between hot-loop reports. Rounded up to a power of two.
    pub fn loop_report_stride(mut self, stride: u64) -> Self {
        self.loop_report_stride = stride.max(1).next_power_of_two();
        self
    }

    pub fn branch_profiling(mut self, enabled: bool) -> Self {
        self.branch_profiling = enabled;
        self
    }

    pub fn on_hot_loop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LoopReport) + Send + Sync + 'static,
    {
        self.on_hot_loop = Some(Arc::new(hook));
        self
    }

    pub(crate) fn loop_report_mask(&self) -> u64 {
        self.loop_report_stride - 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_call_depth", &self.max_call_depth)
            .field("max_stack_slots", &self.max_stack_slots)
            .field("max_memory_pages", &self.max_memory_pages)
            .field("max_table_elements", &self.max_table_elements)
            .field("loop_report_stride", &self.loop_report_stride)
            .field("branch_profiling", &self.branch_profiling)
            .field("on_hot_loop", &self.on_hot_loop.is_some())
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_rounds_to_power_of_two() {
        let c = Config::new().loop_report_stride(100);
        assert_eq!(c.loop_report_stride, 128);
        assert_eq!(c.loop_report_mask(), 127);
        assert_eq!(Config::new().loop_report_stride(0).loop_report_stride, 1);
    }

    #[test]
    fn call_depth_is_at_least_one() {
        assert_eq!(Config::new().max_call_depth(0).max_call_depth, 1);
    }
}
