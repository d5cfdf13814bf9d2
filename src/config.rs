use crate::registry::FaultTolerancePolicy;
use std::env;

/// When non-unique eager updates run relative to the actor's own state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerApplyMode {
    ConcurrentWithWrite,
    AfterWrite,
}

impl EagerApplyMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Some(EagerApplyMode::ConcurrentWithWrite),
            "after-write" | "after_write" => Some(EagerApplyMode::AfterWrite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexingConfig {
    pub queues_per_interface: u32,
    pub fault_tolerant: bool,
    pub eager_apply: EagerApplyMode,
    pub key_buckets: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig {
            queues_per_interface: 4,
            fault_tolerant: false,
            eager_apply: EagerApplyMode::ConcurrentWithWrite,
            key_buckets: 8,
        }
    }
}

impl IndexingConfig {
    pub fn from_env() -> Self {
        let defaults = IndexingConfig::default();
        IndexingConfig {
            queues_per_interface: env::var("INDEXFLOW_QUEUES_PER_INTERFACE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.queues_per_interface),
            fault_tolerant: env::var("INDEXFLOW_FAULT_TOLERANT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.fault_tolerant),
            eager_apply: env::var("INDEXFLOW_EAGER_APPLY")
                .ok()
                .and_then(|s| EagerApplyMode::parse(&s))
                .unwrap_or(defaults.eager_apply),
            key_buckets: env::var("INDEXFLOW_KEY_BUCKETS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.key_buckets),
        }
    }

    pub fn with_fault_tolerance(mut self, enabled: bool) -> Self {
        self.fault_tolerant = enabled;
        self
    }

    pub fn with_queues_per_interface(mut self, n: u32) -> Self {
        self.queues_per_interface = n.max(1);
        self
    }

    pub fn with_eager_apply(mut self, mode: EagerApplyMode) -> Self {
        self.eager_apply = mode;
        self
    }

    /// Policy for interfaces registered without an explicit one.
    pub fn default_fault_tolerance(&self) -> FaultTolerancePolicy {
        if self.fault_tolerant {
            FaultTolerancePolicy::FaultTolerant
        } else {
            FaultTolerancePolicy::NonFaultTolerant
        }
    }
}
