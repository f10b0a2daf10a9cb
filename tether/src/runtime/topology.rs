//! CPU placement for dispatch loops.
//!
//! Loops are unpinned unless their [`ThreadSpec`] names a core or the
//! runtime is built with [`CpuConfig::RoundRobin`], which spreads loops
//! without an explicit core over the cores this process may run on.
//!
//! [`ThreadSpec`]: super::ThreadSpec

use core_affinity::CoreId;

/// Pinning policy for loops that do not name a core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuConfig {
    /// Leave placement to the OS.
    #[default]
    Disabled,
    /// Assign available cores in order, wrapping around.
    RoundRobin,
}

impl CpuConfig {
    /// Core for the `index`-th loop, if any.
    #[must_use]
    pub fn core_for(self, index: usize, available: &[usize]) -> Option<usize> {
        match self {
            Self::Disabled => None,
            Self::RoundRobin if available.is_empty() => None,
            Self::RoundRobin => Some(available[index % available.len()]),
        }
    }
}

/// Cores the current process may be pinned to.
#[must_use]
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Pins the current thread to `core_id`.
///
/// Returns `false` if the core does not exist or the OS refuses.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_assigns() {
        assert_eq!(CpuConfig::Disabled.core_for(0, &[0, 1]), None);
    }

    #[test]
    fn round_robin_wraps() {
        let cores = [2, 5];
        let plan: Vec<_> = (0..4)
            .map(|i| CpuConfig::RoundRobin.core_for(i, &cores))
            .collect();
        assert_eq!(plan, [Some(2), Some(5), Some(2), Some(5)]);
        assert_eq!(CpuConfig::RoundRobin.core_for(0, &[]), None);
    }

    #[test]
    fn available_cores_are_reported() {
        // Containers may hide affinity; only check consistency.
        let cores = available_cores();
        let mut sorted = cores.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), cores.len());
    }
}
