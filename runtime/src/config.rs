// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ambient configuration surface for [`Runtime`](crate::runtime::Runtime):
//! a programmatic builder, no file or environment parsing. This is an
//! embedded library, not a service.

/// Configures worker thread count, naming, and CPU pinning for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) worker_count: usize,
    pub(crate) pin_workers: bool,
    pub(crate) thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            pin_workers: false,
            thread_name_prefix: "runtime-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder(RuntimeConfig::default())
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[must_use]
    pub fn pin_workers(&self) -> bool {
        self.pin_workers
    }

    #[must_use]
    pub fn thread_name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }
}

/// Builder for [`RuntimeConfig`].
pub struct RuntimeConfigBuilder(RuntimeConfig);

impl RuntimeConfigBuilder {
    /// Overrides the default (detected CPU count) worker thread count.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.0.worker_count = count.max(1);
        self
    }

    /// Requests each worker thread bind itself to a distinct CPU. Best-effort:
    /// a host without pinning support silently ignores this.
    #[must_use]
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.0.pin_workers = pin;
        self
    }

    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.0.thread_name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_at_least_one() {
        assert!(RuntimeConfig::default().worker_count() >= 1);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = RuntimeConfig::builder()
            .worker_count(3)
            .pin_workers(true)
            .thread_name_prefix("mc")
            .build();
        assert_eq!(cfg.worker_count(), 3);
        assert!(cfg.pin_workers());
        assert_eq!(cfg.thread_name_prefix(), "mc");
    }

    #[test]
    fn worker_count_zero_is_clamped_to_one() {
        let cfg = RuntimeConfig::builder().worker_count(0).build();
        assert_eq!(cfg.worker_count(), 1);
    }
}
