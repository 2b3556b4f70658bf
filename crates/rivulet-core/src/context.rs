//! Process-wide context: the explicit home of what would otherwise be ambient globals.
//!
//! A [`Context`] owns the operator registry, the communication backend, the boxing-plan cache,
//! the unique-name counter, and the signature tie-break policy. Components take a reference to
//! the context instead of reading global state; a context lives from first framework call to
//! process exit, and dropping it is the only cache invalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{CommBackend, InProcessBackend};
use crate::boxing::{self, BoxingError, BoxingPlan};
use crate::placement::Placement;
use crate::registry::{Operator, Registry};
use crate::sbp::Distribution;

// ---------------------------------------------------------------------------
// Tie-break policy
// ---------------------------------------------------------------------------

/// Policy for choosing among an operator's usable distribution signatures.
///
/// The choice is a heuristic, not a global optimum, so it is configurable rather than fixed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Prefer signatures needing no boxing, then fewer total collectives, then declaration
    /// order.
    #[default]
    PreferNoBoxing,
    /// Take the first usable signature in declaration order.
    DeclarationOrder,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

type BoxingCacheKey = (Distribution, Distribution, Placement);

/// Shared state of one engine instance.
#[derive(Debug)]
pub struct Context {
    registry: Registry,
    backend: Arc<dyn CommBackend>,
    boxing_cache: Mutex<HashMap<BoxingCacheKey, BoxingPlan>>,
    name_counter: AtomicU64,
    tie_break: TieBreak,
}

impl Context {
    /// Creates a context with every built-in operator and the in-process backend.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(InProcessBackend::new()))
    }

    /// Creates a context with every built-in operator over a custom backend.
    pub fn with_backend(backend: Arc<dyn CommBackend>) -> Self {
        Self {
            registry: Registry::with_builtins(),
            backend,
            boxing_cache: Mutex::new(HashMap::new()),
            name_counter: AtomicU64::new(0),
            tie_break: TieBreak::default(),
        }
    }

    /// Replaces the tie-break policy.
    pub fn set_tie_break(&mut self, tie_break: TieBreak) {
        self.tie_break = tie_break;
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Registers an additional operator, replacing any previous registration of its kind.
    pub fn register_operator(&mut self, operator: Box<dyn Operator>) {
        self.registry.register(operator);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backend(&self) -> &dyn CommBackend {
        self.backend.as_ref()
    }

    /// Returns a process-unique node name for `op_kind`, e.g. `add-0`.
    pub fn unique_name(&self, op_kind: &str) -> String {
        let index = self.name_counter.fetch_add(1, Ordering::Relaxed);
        format!("{op_kind}-{index}")
    }

    /// Resolves a boxing plan, consulting the process-wide cache first.
    ///
    /// Only successful resolutions are cached; resolution is deterministic, so a cached plan is
    /// structurally identical to a fresh one.
    pub fn boxing_plan(
        &self,
        source: &Distribution,
        target: &Distribution,
        placement: &Placement,
    ) -> Result<BoxingPlan, BoxingError> {
        let key = (source.clone(), target.clone(), placement.clone());
        if let Ok(cache) = self.boxing_cache.lock() {
            if let Some(plan) = cache.get(&key) {
                return Ok(plan.clone());
            }
        }
        let plan = boxing::resolve(source, target, placement)?;
        if let Ok(mut cache) = self.boxing_cache.lock() {
            cache.insert(key, plan.clone());
        }
        Ok(plan)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
