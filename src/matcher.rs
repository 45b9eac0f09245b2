//! Matcher type and the lock-free snapshot registry that holds them.
//!
//! Ports `examples/original_source/matcher.go`. The registry swaps a
//! whole sorted `Vec` behind an `ArcSwap` rather than taking a read lock
//! per dispatch (the Go original's `sync.RWMutex`-guarded pointer-slice
//! clone) — the same "cheap immutable snapshot" shape the teacher uses
//! for `AgentDeps.links`.

use crate::rule::{Handler, Rule};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// The OneBot post-type a matcher listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRule {
    Message,
    Notice,
    Request,
    MetaEvent,
}

impl TypeRule {
    pub fn matches(&self, post_type: &str) -> bool {
        matches!(
            (self, post_type),
            (TypeRule::Message, "message")
                | (TypeRule::Notice, "notice")
                | (TypeRule::Request, "request")
                | (TypeRule::MetaEvent, "meta_event")
        )
    }
}

static NEXT_MATCHER_ID: AtomicUsize = AtomicUsize::new(1);

/// A registered rule chain plus its terminal handler.
pub struct Matcher {
    pub id: usize,
    pub r#type: TypeRule,
    pub rules: Vec<Rule>,
    pub handler: Option<Handler>,
    /// Back-reference by key, not by owning pointer — breaks the
    /// engine-matcher reference cycle an `Arc<Engine>` field would create.
    pub engine: Option<String>,
    priority: AtomicI64,
    block: std::sync::atomic::AtomicBool,
    brk: std::sync::atomic::AtomicBool,
    temp: std::sync::atomic::AtomicBool,
}

impl Matcher {
    pub fn new(r#type: TypeRule, rules: Vec<Rule>, engine: Option<String>) -> Self {
        Self {
            id: NEXT_MATCHER_ID.fetch_add(1, Ordering::Relaxed),
            r#type,
            rules,
            handler: None,
            engine,
            priority: AtomicI64::new(i64::MAX),
            block: std::sync::atomic::AtomicBool::new(false),
            brk: std::sync::atomic::AtomicBool::new(false),
            temp: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, p: i64) {
        self.priority.store(p, Ordering::Relaxed);
    }

    pub fn is_block(&self) -> bool {
        self.block.load(Ordering::Relaxed)
    }

    pub fn set_block(&self, v: bool) {
        self.block.store(v, Ordering::Relaxed);
    }

    /// Whether a failure of this matcher's own rules (not its engine's
    /// pre/mid handlers) should abort the rest of the dispatch snapshot
    /// rather than just moving on to the next matcher. Ports `Matcher.Break`.
    pub fn breaks_on_false(&self) -> bool {
        self.brk.load(Ordering::Relaxed)
    }

    pub fn set_break(&self, v: bool) {
        self.brk.store(v, Ordering::Relaxed);
    }

    pub fn is_temp(&self) -> bool {
        self.temp.load(Ordering::Relaxed)
    }

    pub fn set_temp(&self, v: bool) {
        self.temp.store(v, Ordering::Relaxed);
    }
}

/// Lock-free snapshot registry of live matchers, sorted ascending by
/// priority (stable within equal priorities).
pub struct MatcherRegistry {
    snapshot: ArcSwap<Vec<Arc<Matcher>>>,
    write_lock: Mutex<()>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// A read-only snapshot for a single dispatch pass. Cheap: clones an
    /// `Arc`, not the underlying `Vec`.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Matcher>>> {
        self.snapshot.load_full()
    }

    pub fn store(&self, matcher: Arc<Matcher>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next: Vec<Arc<Matcher>> = (**self.snapshot.load()).clone();
        next.push(matcher);
        next.sort_by_key(|m| m.priority());
        self.snapshot.store(Arc::new(next));
    }

    pub fn delete(&self, id: usize) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next: Vec<Arc<Matcher>> = (**self.snapshot.load()).clone();
        next.retain(|m| m.id != id);
        self.snapshot.store(Arc::new(next));
    }

    pub fn delete_by_engine(&self, service: &str) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next: Vec<Arc<Matcher>> = (**self.snapshot.load()).clone();
        next.retain(|m| m.engine.as_deref() != Some(service));
        self.snapshot.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_stays_sorted_across_concurrent_inserts() {
        let registry = MatcherRegistry::new();
        for p in [30, 10, 20] {
            let m = Arc::new(Matcher::new(TypeRule::Message, vec![], None));
            m.set_priority(p);
            registry.store(m);
        }
        let snap = registry.snapshot();
        let priorities: Vec<i64> = snap.iter().map(|m| m.priority()).collect();
        assert_eq!(priorities, vec![10, 20, 30]);
    }

    #[test]
    fn delete_removes_matcher_without_affecting_prior_snapshot() {
        let registry = MatcherRegistry::new();
        let m = Arc::new(Matcher::new(TypeRule::Message, vec![], None));
        m.set_priority(1);
        registry.store(m.clone());
        let old_snap = registry.snapshot();
        registry.delete(m.id);
        assert_eq!(old_snap.len(), 1);
        assert_eq!(registry.snapshot().len(), 0);
    }
}
