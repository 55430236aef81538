// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hierarchical cancellation scopes.
//!
//! A [`Lifetime`] is a cheap `Copy` handle into a process-wide arena of scope
//! nodes. Parent/child edges are node indices, so there are no reference
//! cycles between scopes and the callbacks they own.
//!
//! # Guarantees
//!
//! - Termination is idempotent: only the first `terminate` runs anything.
//! - Registered actions and nested scopes are torn down in LIFO order.
//! - `execute_if_alive` never runs its body on a terminated scope, and
//!   `terminate` waits (bounded) for bodies running on other threads unless
//!   the scope allows termination under execution.
//! - A handle to a recycled node reads as terminated (generation check).
//!
//! # Example
//!
//! ```
//! use rdsync::core::LifetimeDef;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let def = LifetimeDef::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//! def.on_termination(move || { h.fetch_add(1, Ordering::SeqCst); });
//! assert!(def.terminate());
//! assert!(!def.terminate());
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use crate::config::TERMINATION_WAIT_TIMEOUT;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::time::Instant;

type Action = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeRef {
    index: u32,
    generation: u32,
}

/// Observable state of a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifetimeStatus {
    Alive,
    /// Termination requested, waiting for in-flight executions
    Canceling,
    /// Running termination actions
    Terminating,
    Terminated,
}

enum Entry {
    Action(Action),
    Child(NodeRef),
}

struct Node {
    generation: u32,
    status: LifetimeStatus,
    parents: Vec<NodeRef>,
    entries: Vec<Entry>,
    executing: usize,
    allow_termination_under_execution: bool,
}

impl Node {
    fn vacant() -> Self {
        Self {
            generation: 0,
            status: LifetimeStatus::Terminated,
            parents: Vec::new(),
            entries: Vec::new(),
            executing: 0,
            allow_termination_under_execution: false,
        }
    }

    fn accepts_entries(&self) -> bool {
        matches!(
            self.status,
            LifetimeStatus::Alive | LifetimeStatus::Canceling
        )
    }
}

#[derive(Default)]
struct ArenaInner {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl ArenaInner {
    fn get(&self, r: NodeRef) -> Option<&Node> {
        self.nodes
            .get(r.index as usize)
            .filter(|n| n.generation == r.generation && n.status != LifetimeStatus::Terminated)
    }

    fn get_mut(&mut self, r: NodeRef) -> Option<&mut Node> {
        self.nodes
            .get_mut(r.index as usize)
            .filter(|n| n.generation == r.generation && n.status != LifetimeStatus::Terminated)
    }

    fn alloc(&mut self, parents: Vec<NodeRef>) -> NodeRef {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.nodes.push(Node::vacant());
                (self.nodes.len() - 1) as u32
            }
        };
        let node = &mut self.nodes[index as usize];
        node.status = LifetimeStatus::Alive;
        node.parents = parents;
        node.entries.clear();
        node.executing = 0;
        node.allow_termination_under_execution = false;
        NodeRef {
            index,
            generation: node.generation,
        }
    }

    fn release(&mut self, r: NodeRef) {
        let parents = match self.get_mut(r) {
            Some(node) => std::mem::take(&mut node.parents),
            None => return,
        };
        for parent in parents {
            if let Some(p) = self.get_mut(parent) {
                p.entries
                    .retain(|e| !matches!(e, Entry::Child(c) if *c == r));
            }
        }
        let node = &mut self.nodes[r.index as usize];
        node.status = LifetimeStatus::Terminated;
        node.entries.clear();
        node.executing = 0;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(r.index);
    }
}

struct LifetimeArena {
    inner: Mutex<ArenaInner>,
    executions_done: Condvar,
}

fn arena() -> &'static LifetimeArena {
    static ARENA: OnceLock<LifetimeArena> = OnceLock::new();
    ARENA.get_or_init(|| LifetimeArena {
        inner: Mutex::new(ArenaInner::default()),
        executions_done: Condvar::new(),
    })
}

thread_local! {
    // Scopes whose execute_if_alive body is running on this thread.
    static EXECUTING: RefCell<Vec<NodeRef>> = const { RefCell::new(Vec::new()) };
}

struct ExecutionGuard(NodeRef);

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let arena = arena();
        {
            let mut inner = arena.inner.lock();
            if let Some(node) = inner.get_mut(self.0) {
                node.executing = node.executing.saturating_sub(1);
            }
        }
        arena.executions_done.notify_all();
        EXECUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|r| *r == self.0) {
                stack.remove(pos);
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn terminate_node(r: NodeRef) -> bool {
    let arena = arena();
    let mut inner = arena.inner.lock();
    match inner.get_mut(r) {
        Some(node) if node.status == LifetimeStatus::Alive => {
            node.status = LifetimeStatus::Canceling;
        }
        _ => return false,
    }

    let own = EXECUTING.with(|stack| stack.borrow().iter().filter(|x| **x == r).count());
    let deadline = Instant::now() + TERMINATION_WAIT_TIMEOUT;
    loop {
        let Some(node) = inner.get(r) else { break };
        if node.allow_termination_under_execution || node.executing <= own {
            if own > 0 && !node.allow_termination_under_execution {
                log::warn!(
                    "lifetime terminated from inside its own execute_if_alive ({} frame(s))",
                    own
                );
            }
            break;
        }
        if arena
            .executions_done
            .wait_until(&mut inner, deadline)
            .timed_out()
        {
            log::error!(
                "lifetime termination gave up waiting for {} in-flight execution(s) after {:?}",
                inner.get(r).map_or(0, |n| n.executing),
                TERMINATION_WAIT_TIMEOUT
            );
            break;
        }
    }

    let entries = match inner.get_mut(r) {
        Some(node) => {
            node.status = LifetimeStatus::Terminating;
            std::mem::take(&mut node.entries)
        }
        None => Vec::new(),
    };
    drop(inner);

    for entry in entries.into_iter().rev() {
        match entry {
            Entry::Action(action) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
                    log::error!(
                        "termination action panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            Entry::Child(child) => {
                terminate_node(child);
            }
        }
    }

    arena.inner.lock().release(r);
    arena.executions_done.notify_all();
    true
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Eternal,
    Terminated,
    Node(NodeRef),
}

/// Read-only handle to a cancellation scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime(Kind);

impl Lifetime {
    /// A scope that never terminates.
    pub const fn eternal() -> Self {
        Self(Kind::Eternal)
    }

    /// A scope that is already terminated.
    pub const fn terminated() -> Self {
        Self(Kind::Terminated)
    }

    pub fn is_eternal(&self) -> bool {
        matches!(self.0, Kind::Eternal)
    }

    pub fn status(&self) -> LifetimeStatus {
        match self.0 {
            Kind::Eternal => LifetimeStatus::Alive,
            Kind::Terminated => LifetimeStatus::Terminated,
            Kind::Node(r) => arena()
                .inner
                .lock()
                .get(r)
                .map_or(LifetimeStatus::Terminated, |n| n.status),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status() == LifetimeStatus::Alive
    }

    /// Register `action` to run on termination.
    ///
    /// Runs `action` immediately when the scope is already terminated (or
    /// terminating) and returns `false` in that case.
    pub fn on_termination(&self, action: impl FnOnce() + Send + 'static) -> bool {
        match self.try_add(Box::new(action)) {
            Ok(()) => true,
            Err(action) => {
                action();
                false
            }
        }
    }

    /// Like [`on_termination`](Self::on_termination) but drops `action`
    /// instead of running it when the scope is no longer accepting entries.
    pub fn on_termination_if_alive(&self, action: impl FnOnce() + Send + 'static) -> bool {
        self.try_add(Box::new(action)).is_ok()
    }

    fn try_add(&self, action: Action) -> Result<(), Action> {
        match self.0 {
            // Never runs: dropping keeps eternal scopes from accumulating.
            Kind::Eternal => Ok(()),
            Kind::Terminated => Err(action),
            Kind::Node(r) => {
                let mut inner = arena().inner.lock();
                match inner.get_mut(r) {
                    Some(node) if node.accepts_entries() => {
                        node.entries.push(Entry::Action(action));
                        Ok(())
                    }
                    _ => Err(action),
                }
            }
        }
    }

    /// Run `body` only while the scope is alive; termination from other
    /// threads waits for it to finish.
    pub fn execute_if_alive<R>(&self, body: impl FnOnce() -> R) -> Option<R> {
        match self.0 {
            Kind::Eternal => Some(body()),
            Kind::Terminated => None,
            Kind::Node(r) => {
                {
                    let mut inner = arena().inner.lock();
                    match inner.get_mut(r) {
                        Some(node) if node.status == LifetimeStatus::Alive => {
                            node.executing += 1;
                        }
                        _ => return None,
                    }
                }
                EXECUTING.with(|stack| stack.borrow_mut().push(r));
                let _guard = ExecutionGuard(r);
                Some(body())
            }
        }
    }

    /// Run `open` if alive and register `close` for termination, atomically
    /// with respect to termination.
    pub fn bracket_if_alive<R>(
        &self,
        open: impl FnOnce() -> R,
        close: impl FnOnce() + Send + 'static,
    ) -> Option<R> {
        self.execute_if_alive(|| {
            let result = open();
            if let Err(close) = self.try_add(Box::new(close)) {
                close();
            }
            result
        })
    }

    /// New child scope, terminated together with this one.
    pub fn create_nested(&self) -> LifetimeDef {
        match self.0 {
            Kind::Eternal => {
                let r = arena().inner.lock().alloc(Vec::new());
                LifetimeDef::from_node(r)
            }
            Kind::Terminated => LifetimeDef::terminated(),
            Kind::Node(parent) => {
                let mut inner = arena().inner.lock();
                if !inner.get(parent).is_some_and(|n| n.status == LifetimeStatus::Alive) {
                    return LifetimeDef::terminated();
                }
                let child = inner.alloc(vec![parent]);
                if let Some(p) = inner.get_mut(parent) {
                    p.entries.push(Entry::Child(child));
                }
                LifetimeDef::from_node(child)
            }
        }
    }

    /// New scope that terminates as soon as either input terminates.
    pub fn intersect(&self, other: &Lifetime) -> LifetimeDef {
        match (self.0, other.0) {
            (Kind::Terminated, _) | (_, Kind::Terminated) => LifetimeDef::terminated(),
            (Kind::Eternal, _) => other.create_nested(),
            (_, Kind::Eternal) => self.create_nested(),
            (Kind::Node(a), Kind::Node(b)) if a == b => self.create_nested(),
            (Kind::Node(a), Kind::Node(b)) => {
                let mut inner = arena().inner.lock();
                let alive = |n: Option<&Node>| n.is_some_and(|n| n.status == LifetimeStatus::Alive);
                if !alive(inner.get(a)) || !alive(inner.get(b)) {
                    return LifetimeDef::terminated();
                }
                let child = inner.alloc(vec![a, b]);
                for parent in [a, b] {
                    if let Some(p) = inner.get_mut(parent) {
                        p.entries.push(Entry::Child(child));
                    }
                }
                LifetimeDef::from_node(child)
            }
        }
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Kind::Eternal => write!(f, "Lifetime(Eternal)"),
            Kind::Terminated => write!(f, "Lifetime(Terminated)"),
            Kind::Node(r) => write!(
                f,
                "Lifetime(#{}.{} {:?})",
                r.index,
                r.generation,
                self.status()
            ),
        }
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::eternal()
    }
}

/// Owning handle of a scope: the only way to terminate it.
///
/// Dropping a `LifetimeDef` does not terminate the scope.
#[derive(Clone, PartialEq, Eq)]
pub struct LifetimeDef {
    lifetime: Lifetime,
}

impl LifetimeDef {
    /// New root scope.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Lifetime::eternal().create_nested()
    }

    fn from_node(r: NodeRef) -> Self {
        Self {
            lifetime: Lifetime(Kind::Node(r)),
        }
    }

    /// A definition whose scope is already terminated.
    pub fn terminated() -> Self {
        Self {
            lifetime: Lifetime::terminated(),
        }
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Let `terminate` proceed without waiting for in-flight executions.
    pub fn allow_termination_under_execution(&self, allow: bool) {
        if let Kind::Node(r) = self.lifetime.0 {
            if let Some(node) = arena().inner.lock().get_mut(r) {
                node.allow_termination_under_execution = allow;
            }
        }
    }

    /// Terminate the scope. Returns `true` only for the call that did it.
    pub fn terminate(&self) -> bool {
        match self.lifetime.0 {
            Kind::Node(r) => terminate_node(r),
            Kind::Eternal | Kind::Terminated => false,
        }
    }
}

impl Deref for LifetimeDef {
    type Target = Lifetime;

    fn deref(&self) -> &Lifetime {
        &self.lifetime
    }
}

impl fmt::Debug for LifetimeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LifetimeDef({:?})", self.lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: &'static str| {
            let l = l.clone();
            Box::new(move || l.lock().push(tag)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_actions_run_lifo() {
        let (log, make) = recorder();
        let def = LifetimeDef::new();
        def.on_termination(make("first"));
        def.on_termination(make("second"));
        def.on_termination(make("third"));
        def.terminate();
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_children_terminate_with_parent_in_lifo_position() {
        let (log, make) = recorder();
        let parent = LifetimeDef::new();
        parent.on_termination(make("parent-before"));
        let child = parent.create_nested();
        child.on_termination(make("child"));
        parent.on_termination(make("parent-after"));

        parent.terminate();
        assert_eq!(*log.lock(), vec!["parent-after", "child", "parent-before"]);
        assert!(!child.is_alive());
        assert_eq!(child.status(), LifetimeStatus::Terminated);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let def = LifetimeDef::new();
        let h = hits.clone();
        def.on_termination(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(def.terminate());
        assert!(!def.terminate());
        assert!(!def.clone().terminate());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_termination_after_death_runs_immediately() {
        let def = LifetimeDef::new();
        def.terminate();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        assert!(!def.on_termination(move || r.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));

        let r = ran.clone();
        ran.store(false, Ordering::SeqCst);
        assert!(!def.on_termination_if_alive(move || r.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_execute_if_alive_guards_body() {
        let def = LifetimeDef::new();
        assert_eq!(def.execute_if_alive(|| 5), Some(5));
        def.terminate();
        assert_eq!(def.execute_if_alive(|| 5), None);
        assert_eq!(Lifetime::terminated().execute_if_alive(|| 1), None);
        assert_eq!(Lifetime::eternal().execute_if_alive(|| 1), Some(1));
    }

    #[test]
    fn test_terminate_waits_for_other_thread_execution() {
        let def = LifetimeDef::new();
        let lifetime = def.lifetime();
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (e, f) = (entered.clone(), finished.clone());
        let worker = std::thread::spawn(move || {
            lifetime.execute_if_alive(|| {
                e.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                f.store(true, Ordering::SeqCst);
            });
        });
        while !entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        def.terminate();
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[test]
    fn test_termination_from_inside_execution_does_not_deadlock() {
        let def = LifetimeDef::new();
        let inner = def.clone();
        let result = def.execute_if_alive(move || inner.terminate());
        assert_eq!(result, Some(true));
        assert!(!def.is_alive());
    }

    #[test]
    fn test_bracket_registers_close() {
        let (log, make) = recorder();
        let def = LifetimeDef::new();
        let l = log.clone();
        let opened = def.bracket_if_alive(move || l.lock().push("open"), make("close"));
        assert!(opened.is_some());
        def.terminate();
        assert_eq!(*log.lock(), vec!["open", "close"]);

        let (log, make) = recorder();
        assert!(def.bracket_if_alive(|| (), make("never")).is_none());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_intersection_dies_with_either_side() {
        let a = LifetimeDef::new();
        let b = LifetimeDef::new();
        let both = a.intersect(&b.lifetime());
        assert!(both.is_alive());
        b.terminate();
        assert!(!both.is_alive());
        assert!(a.is_alive());

        let c = LifetimeDef::new();
        let dead = c.intersect(&Lifetime::terminated());
        assert!(!dead.is_alive());
        let nested_eternal = Lifetime::eternal().intersect(&c.lifetime());
        c.terminate();
        assert!(!nested_eternal.is_alive());
        a.terminate();
    }

    #[test]
    fn test_early_child_termination_detaches_from_parent() {
        let (log, make) = recorder();
        let parent = LifetimeDef::new();
        let child = parent.create_nested();
        child.on_termination(make("child"));
        child.terminate();
        parent.terminate();
        assert_eq!(*log.lock(), vec!["child"]);
    }

    #[test]
    fn test_stale_handle_reads_terminated_after_reuse() {
        let def = LifetimeDef::new();
        let stale = def.lifetime();
        def.terminate();
        let fresh: Vec<LifetimeDef> = (0..8).map(|_| LifetimeDef::new()).collect();
        assert!(!stale.is_alive());
        for f in fresh {
            assert!(f.is_alive());
            f.terminate();
        }
    }

    #[test]
    fn test_panicking_action_does_not_stop_teardown() {
        let (log, make) = recorder();
        let def = LifetimeDef::new();
        def.on_termination(make("survivor"));
        def.on_termination(|| panic!("boom"));
        def.terminate();
        assert_eq!(*log.lock(), vec!["survivor"]);
    }
}
