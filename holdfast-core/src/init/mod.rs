//! Dependency-completion tracking for warm-up.
//!
//! Targets register with a manager; `initialize` fans out to every target,
//! and the watcher fires exactly once when the last target reports ready.
//! Everything here runs on the single control thread.

use std::{cell::RefCell, rc::Rc};

use tracing::{debug, warn};

/// One-shot completion callback handed to [`Manager::initialize`].
pub struct Watcher {
    name: String,
    on_ready: Box<dyn FnOnce()>,
}

impl Watcher {
    pub fn new(name: impl ToString, on_ready: impl FnOnce() + 'static) -> Self {
        Self {
            name: name.to_string(),
            on_ready: Box::new(on_ready),
        }
    }

    fn fire(self) {
        debug!("init watcher {} notified", self.name);
        (self.on_ready)();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Initialized,
}

struct ManagerState {
    name: String,
    phase: Phase,
    pending: usize,
    watcher: Option<Watcher>,
    registered: Vec<Target>,
}

/// Tracks a set of sibling [`Target`]s; clones share the same state.
#[derive(Clone)]
pub struct Manager {
    state: Rc<RefCell<ManagerState>>,
}

impl Manager {
    pub fn new(name: impl ToString) -> Self {
        Self {
            state: Rc::new(RefCell::new(ManagerState {
                name: name.to_string(),
                phase: Phase::Uninitialized,
                pending: 0,
                watcher: None,
                registered: Vec::new(),
            })),
        }
    }

    /// Register a target. A target added while initialization is in flight is
    /// started immediately.
    pub fn add(&self, target: &Target) {
        let phase = self.state.borrow().phase;
        match phase {
            Phase::Uninitialized => self.state.borrow_mut().registered.push(target.clone()),
            Phase::Initializing => {
                if start_target(&self.state, target, true) {
                    maybe_complete(&self.state);
                }
            }
            Phase::Initialized => {
                warn!(
                    "target {} added to already-initialized manager {}; ignored",
                    target.name(),
                    self.state.borrow().name
                );
            }
        }
    }

    /// Start every registered target; `watcher` fires once all of them have
    /// reported ready (immediately if there is nothing to wait for).
    pub fn initialize(&self, watcher: Watcher) {
        let targets = {
            let mut state = self.state.borrow_mut();
            if state.phase != Phase::Uninitialized {
                warn!("init manager {} initialized twice; ignored", state.name);
                return;
            }
            debug!("init manager {} initializing", state.name);
            state.phase = Phase::Initializing;
            state.watcher = Some(watcher);
            std::mem::take(&mut state.registered)
        };

        // Count all pending targets before invoking any init callback, so a
        // target completing synchronously cannot fire the watcher while its
        // siblings are still unstarted.
        let mut to_start = Vec::new();
        for target in &targets {
            let mut inner = target.state.borrow_mut();
            if inner.ready_seen {
                continue;
            }
            inner.manager = Some(self.state.clone());
            to_start.push(target.clone());
        }
        self.state.borrow_mut().pending = to_start.len();

        for target in &to_start {
            run_target_init(target);
        }
        maybe_complete(&self.state);
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().phase == Phase::Initialized
    }
}

/// Link a target into an initializing manager. Returns true if the caller
/// should re-check completion (the target was already satisfied).
fn start_target(state: &Rc<RefCell<ManagerState>>, target: &Target, count: bool) -> bool {
    {
        let mut inner = target.state.borrow_mut();
        if inner.ready_seen {
            return true;
        }
        inner.manager = Some(state.clone());
    }
    if count {
        state.borrow_mut().pending += 1;
    }
    run_target_init(target);
    false
}

fn run_target_init(target: &Target) {
    let init = target.state.borrow_mut().on_init.take();
    if let Some(init) = init {
        init(target.clone());
    }
}

fn maybe_complete(state: &Rc<RefCell<ManagerState>>) {
    let watcher = {
        let mut inner = state.borrow_mut();
        if inner.phase == Phase::Initializing && inner.pending == 0 {
            inner.phase = Phase::Initialized;
            inner.watcher.take()
        } else {
            None
        }
    };
    if let Some(watcher) = watcher {
        watcher.fire();
    }
}

struct TargetState {
    name: String,
    on_init: Option<Box<dyn FnOnce(Target)>>,
    ready_seen: bool,
    manager: Option<Rc<RefCell<ManagerState>>>,
}

/// A single async dependency. The init callback receives a clone of the
/// target so it can signal [`Target::ready`] whenever the dependency
/// resolves, synchronously or later.
#[derive(Clone)]
pub struct Target {
    state: Rc<RefCell<TargetState>>,
}

impl Target {
    pub fn new(name: impl ToString, on_init: impl FnOnce(Target) + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(TargetState {
                name: name.to_string(),
                on_init: Some(Box::new(on_init)),
                ready_seen: false,
                manager: None,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    /// Mark the dependency resolved. Idempotent; the second and later calls
    /// are no-ops, which lets a listener force readiness on teardown without
    /// tracking whether the normal path already fired.
    pub fn ready(&self) {
        let manager = {
            let mut inner = self.state.borrow_mut();
            if inner.ready_seen {
                return;
            }
            inner.ready_seen = true;
            inner.manager.take()
        };
        if let Some(manager) = manager {
            {
                let mut state = manager.borrow_mut();
                state.pending = state.pending.saturating_sub(1);
            }
            maybe_complete(&manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn watcher_fires_after_all_targets_ready() {
        let manager = Manager::new("test");
        let t1 = Target::new("t1", |_| {});
        let t2 = Target::new("t2", |_| {});
        manager.add(&t1);
        manager.add(&t2);

        let fired = Rc::new(Cell::new(0));
        let fired_w = fired.clone();
        manager.initialize(Watcher::new("w", move || fired_w.set(fired_w.get() + 1)));
        assert_eq!(fired.get(), 0);

        t1.ready();
        assert_eq!(fired.get(), 0);
        t2.ready();
        assert_eq!(fired.get(), 1);
        assert!(manager.is_initialized());

        // Forced readiness after the fact stays a no-op.
        t2.ready();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn synchronously_ready_targets_do_not_fire_early() {
        let manager = Manager::new("test");
        let t1 = Target::new("sync", |t| t.ready());
        let t2 = Target::new("async", |_| {});
        manager.add(&t1);
        manager.add(&t2);

        let fired = Rc::new(Cell::new(false));
        let fired_w = fired.clone();
        manager.initialize(Watcher::new("w", move || fired_w.set(true)));
        assert!(!fired.get());
        t2.ready();
        assert!(fired.get());
    }

    #[test]
    fn empty_manager_completes_immediately() {
        let manager = Manager::new("empty");
        let fired = Rc::new(Cell::new(false));
        let fired_w = fired.clone();
        manager.initialize(Watcher::new("w", move || fired_w.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn target_ready_before_initialize_counts_as_done() {
        let manager = Manager::new("test");
        let t1 = Target::new("early", |_| {});
        manager.add(&t1);
        t1.ready();

        let fired = Rc::new(Cell::new(false));
        let fired_w = fired.clone();
        manager.initialize(Watcher::new("w", move || fired_w.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn late_added_target_is_started_immediately() {
        let manager = Manager::new("test");
        let t1 = Target::new("t1", |_| {});
        manager.add(&t1);

        let fired = Rc::new(Cell::new(false));
        let fired_w = fired.clone();
        manager.initialize(Watcher::new("w", move || fired_w.set(true)));

        let initialized = Rc::new(Cell::new(false));
        let initialized_c = initialized.clone();
        let t2 = Target::new("late", move |_| initialized_c.set(true));
        manager.add(&t2);
        assert!(initialized.get());

        t1.ready();
        assert!(!fired.get());
        t2.ready();
        assert!(fired.get());
    }
}
