//! Resource limits applied to every Instance created by a `Host`.

use tessel_runtime::MAX_PAGES;

/// Limits that keep guest code from exhausting host resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Deepest call chain (guest frames plus host re-entries) before a
    /// `StackOverflow` trap.
    pub max_call_depth: usize,
    /// Operand stack slots per invocation before a `StackOverflow` trap.
    pub max_value_stack: usize,
    /// Upper bound for any linear memory, in 64 KiB pages. Applies to the
    /// initial size and to `memory.grow`.
    pub max_memory_pages: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            max_value_stack: 65536,
            max_memory_pages: MAX_PAGES,
        }
    }
}

impl HostConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_value_stack(mut self, slots: usize) -> Self {
        self.max_value_stack = slots;
        self
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages.min(MAX_PAGES);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert_eq!(config.max_call_depth, 1024);
        assert_eq!(config.max_value_stack, 65536);
        assert_eq!(config.max_memory_pages, 65536);
    }

    #[test]
    fn page_limit_is_clamped() {
        let config = HostConfig::default().with_max_memory_pages(u32::MAX);
        assert_eq!(config.max_memory_pages, MAX_PAGES);
    }
}
