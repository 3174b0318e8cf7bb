//! Health and discovery gates consulted before every scheduled poll.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait Activator: Send + Sync + fmt::Debug {
    fn enabled(&self) -> bool;
}

/// Fixed answer, mostly for tests and single-instance deployments
#[derive(Debug, Clone, Copy)]
pub struct StaticActivator(pub bool);

impl Activator for StaticActivator {
    fn enabled(&self) -> bool {
        self.0
    }
}

/// Flipped at runtime, e.g. when an instance starts draining
#[derive(Debug)]
pub struct SwitchActivator {
    enabled: AtomicBool,
}

impl SwitchActivator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Activator for SwitchActivator {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

pub fn all_enabled(activators: &[Arc<dyn Activator>]) -> bool {
    activators.iter().all(|a| a.enabled())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_disabled_activator_gates() {
        let switch = Arc::new(SwitchActivator::new(true));
        let activators: Vec<Arc<dyn Activator>> = vec![Arc::new(StaticActivator(true)), switch.clone()];
        assert!(all_enabled(&activators));

        switch.set_enabled(false);
        assert!(!all_enabled(&activators));
        assert!(all_enabled(&[]));
    }
}
