//! Runtime invariants of the install contract.
//!
//! `assert_invariant` logs (and in debug builds panics on) a violated rule, and remembers
//! every rule that held. Tests then use `contract_test` to prove the orchestrator actually
//! checked the rules it claims to enforce.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use lazy_static::lazy_static;
use log::error;

pub const NO_REPLACE_WHILE_RUNNING: &str = "files are never replaced while the application runs";
pub const STABLE_PRODUCT_ID: &str = "install root holds the same product id";
pub const RECORD_MATCHES_REGISTRY: &str = "every registered association is recorded for uninstall";

lazy_static! {
    static ref CHECKED_INVARIANTS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Asserts that a rule of the install contract holds.
///
/// A violation is logged as critical. Debug and test builds panic on it, release builds
/// keep going so the caller's own error path can report it.
pub fn assert_invariant(condition: bool, description: &str, component: Option<&str>) {
    if condition {
        CHECKED_INVARIANTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(description.to_string());
        return;
    }
    let msg = format!(
        "INVARIANT VIOLATION [{}]: {}",
        component.unwrap_or("Installer"),
        description
    );
    error!("{}", msg);
    if cfg!(debug_assertions) || cfg!(test) {
        panic!("{}", msg);
    }
}

/// Panics unless every listed invariant was asserted (and held) at least once.
#[cfg(test)]
pub fn contract_test(context: &str, required: &[&str]) {
    let missing: Vec<&str> = {
        let checked = CHECKED_INVARIANTS.lock().unwrap_or_else(PoisonError::into_inner);
        required.iter().copied().filter(|r| !checked.contains(*r)).collect()
    };
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed. These invariants were never checked:\n{:#?}",
            context, missing
        );
    }
}
