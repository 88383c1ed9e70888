//! Validity gates.
//!
//! A gate is a boolean flag for a logical unit of the project, such as
//! "scripts". A guarding task (a lint pass) resets its unit to `true`
//! before re-evaluating and flips it to `false` when it reports at least
//! one error. Downstream tasks consult the gate and skip their work
//! entirely while it is `false`, which keeps a single failure from being
//! reported twice.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct GateSet {
    units: RwLock<HashMap<Box<str>, bool>>,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gates default to open until a guard says otherwise.
    pub fn get(&self, unit: &str) -> bool {
        let units = self.units.read().unwrap();
        units.get(unit).copied().unwrap_or(true)
    }

    pub fn set(&self, unit: &str, ok: bool) {
        let mut units = self.units.write().unwrap();
        units.insert(unit.into(), ok);
    }

    /// Reopen a unit, called by its guard before re-evaluating.
    pub fn reset(&self, unit: &str) {
        self.set(unit, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_unit_defaults_to_open() {
        let gates = GateSet::new();
        assert!(gates.get("scripts"));
    }

    #[test]
    fn closed_gate_stays_closed_until_reset() {
        let gates = GateSet::new();
        gates.set("scripts", false);
        assert!(!gates.get("scripts"));
        assert!(!gates.get("scripts"));

        gates.reset("scripts");
        assert!(gates.get("scripts"));
    }

    #[test]
    fn units_are_independent() {
        let gates = GateSet::new();
        gates.set("scripts", false);
        assert!(gates.get("app scripts"));
    }
}
