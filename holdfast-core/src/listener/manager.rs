use std::{
    cell::RefCell,
    collections::HashMap,
    os::fd::OwnedFd,
    rc::{Rc, Weak},
};

use tracing::{debug, info};

use super::{FilterChainBuilder, Listener, ListenerContext};
use crate::{config::ListenerConfig, init, net::ListenAddress, ConfigError};

/// Owns every listener of the current config generation and moves them
/// through warming, active and draining.
///
/// Configuration is applied per listener: a rejected listener leaves all
/// previously accepted ones untouched. Runs on the control thread only.
pub struct ListenerManager {
    core: Rc<RefCell<ManagerCore>>,
}

struct ManagerCore {
    global_init: init::Manager,
    concurrency: usize,
    next_tag: u64,
    workers_started: bool,
    active: HashMap<String, Rc<Listener>>,
    warming: HashMap<String, Rc<Listener>>,
    draining: Vec<Rc<Listener>>,
}

impl ListenerManager {
    pub fn new(global_init: init::Manager, concurrency: usize) -> Self {
        Self {
            core: Rc::new(RefCell::new(ManagerCore {
                global_init,
                concurrency,
                next_tag: 0,
                workers_started: false,
                active: HashMap::new(),
                warming: HashMap::new(),
                draining: Vec::new(),
            })),
        }
    }

    /// Called once the worker fleet is accepting; listeners added from here
    /// on warm through their local tracker and direct notification.
    pub fn start_workers(&self) {
        self.core.borrow_mut().workers_started = true;
    }

    /// Add a listener or replace one whose configuration changed. Returns
    /// false when the name and hash match an existing instance (no-op).
    pub fn add_or_update_listener(
        &self,
        name: &str,
        config: &ListenerConfig,
        added_via_api: bool,
        builder: &dyn FilterChainBuilder,
        inherited_socket: Option<OwnedFd>,
    ) -> Result<bool, ConfigError> {
        let hash = config.hash();
        let (workers_started, concurrency, global_init, tag) = {
            let mut core = self.core.borrow_mut();
            let existing = core
                .active
                .get(name)
                .or_else(|| core.warming.get(name));
            if let Some(listener) = existing {
                if listener.hash() == hash {
                    debug!("duplicate listener {name}; no update needed");
                    return Ok(false);
                }
            }
            let tag = core.next_tag;
            core.next_tag += 1;
            (
                core.workers_started,
                core.concurrency,
                core.global_init.clone(),
                tag,
            )
        };

        let weak = Rc::downgrade(&self.core);
        let ctx = ListenerContext {
            workers_started,
            concurrency,
            global_init,
            on_warmed: Rc::new(move |warmed: &str| on_listener_warmed(&weak, warmed)),
            inherited_socket,
            tag,
            added_via_api,
        };
        let listener = Rc::new(Listener::new(name.to_string(), config, ctx, builder)?);
        listener.debug_log("add listener");

        if workers_started {
            // Stage before initialize: warm completion may be synchronous and
            // looks the listener up by name.
            self.core
                .borrow_mut()
                .warming
                .insert(name.to_string(), listener.clone());
            listener.initialize();
        } else {
            listener.initialize();
            self.core
                .borrow_mut()
                .active
                .insert(name.to_string(), listener);
        }
        Ok(true)
    }

    /// Remove a listener entirely. A warming instance is dropped on the spot
    /// (its init target is force-fired); an active one moves to draining.
    pub fn remove_listener(&self, name: &str) -> bool {
        let mut core = self.core.borrow_mut();
        if let Some(listener) = core.warming.remove(name) {
            listener.debug_log("remove warming listener");
            return true;
        }
        if let Some(listener) = core.active.remove(name) {
            listener.debug_log("remove active listener");
            core.draining.push(listener);
            return true;
        }
        false
    }

    /// Begin draining every listener; returns their names so the caller can
    /// stop the corresponding worker accept loops.
    pub fn drain_listeners(&self) -> Vec<String> {
        let mut core = self.core.borrow_mut();
        info!("draining all listeners");
        let names: Vec<String> = core
            .active
            .keys()
            .chain(core.warming.keys())
            .cloned()
            .collect();
        let active: Vec<_> = core.active.drain().map(|(_, l)| l).collect();
        let warming: Vec<_> = core.warming.drain().map(|(_, l)| l).collect();
        core.draining.extend(active);
        core.draining.extend(warming);
        names
    }

    pub fn active_listener(&self, name: &str) -> Option<Rc<Listener>> {
        self.core.borrow().active.get(name).cloned()
    }

    /// Resolved addresses of every active listener.
    pub fn listener_addresses(&self) -> Vec<(String, ListenAddress)> {
        self.core
            .borrow()
            .active
            .iter()
            .map(|(name, l)| (name.clone(), l.address().clone()))
            .collect()
    }

    /// Duplicate each active listener's reserved socket for hand-off to the
    /// next process generation, keyed by address.
    pub fn sockets_for_handoff(&self) -> Vec<(String, OwnedFd)> {
        self.core
            .borrow()
            .active
            .values()
            .filter_map(|l| {
                l.socket_factory()
                    .duplicate_reserved()
                    .map(|fd| (l.address().to_string(), fd))
            })
            .collect()
    }

    pub fn num_active(&self) -> usize {
        self.core.borrow().active.len()
    }

    pub fn num_warming(&self) -> usize {
        self.core.borrow().warming.len()
    }

    pub fn num_draining(&self) -> usize {
        self.core.borrow().draining.len()
    }
}

fn on_listener_warmed(core: &Weak<RefCell<ManagerCore>>, name: &str) {
    let Some(core) = core.upgrade() else {
        return;
    };
    let superseded = {
        let mut core = core.borrow_mut();
        match core.warming.remove(name) {
            Some(listener) => {
                info!("listener {name} warmed and moved to active");
                core.active.insert(name.to_string(), listener)
            }
            None => None,
        }
    };
    if let Some(old) = superseded {
        old.debug_log("draining superseded listener");
        core.borrow_mut().draining.push(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        listener::DefaultFilterChainBuilder,
    };

    fn listener_config(json: &str) -> ListenerConfig {
        let config =
            Config::from_slice(format!(r#"{{ "listeners": {{ "l": {json} }} }}"#).as_bytes())
                .unwrap();
        config.listeners["l"].clone()
    }

    fn stream_config() -> ListenerConfig {
        listener_config(
            r#"{ "address": {"socket_addr": "127.0.0.1:0"},
                 "filter_chains": [{ "filters": [{"name": "tcp_proxy"}] }] }"#,
        )
    }

    fn manager() -> ListenerManager {
        ListenerManager::new(init::Manager::new("global"), 2)
    }

    #[test]
    fn same_hash_is_a_noop() {
        let manager = manager();
        let config = stream_config();
        assert!(manager
            .add_or_update_listener("web", &config, false, &DefaultFilterChainBuilder, None)
            .unwrap());
        assert!(!manager
            .add_or_update_listener("web", &config, false, &DefaultFilterChainBuilder, None)
            .unwrap());
        assert_eq!(manager.num_active(), 1);
    }

    #[test]
    fn rejected_listener_leaves_others_untouched() {
        let manager = manager();
        assert!(manager
            .add_or_update_listener(
                "web",
                &stream_config(),
                false,
                &DefaultFilterChainBuilder,
                None
            )
            .unwrap());

        let bad = listener_config(r#"{ "address": {"socket_addr": "127.0.0.1:0"} }"#);
        let err = manager
            .add_or_update_listener("broken", &bad, true, &DefaultFilterChainBuilder, None)
            .unwrap_err();
        assert!(err.to_string().contains("no filter chains"));
        assert_eq!(manager.num_active(), 1);
        assert!(manager.active_listener("web").is_some());
    }

    #[test]
    fn listener_added_after_workers_started_warms_directly() {
        let manager = manager();
        manager.start_workers();
        assert!(manager
            .add_or_update_listener(
                "late",
                &stream_config(),
                true,
                &DefaultFilterChainBuilder,
                None
            )
            .unwrap());
        // No chain-local dependencies: warm completion is synchronous.
        assert_eq!(manager.num_warming(), 0);
        assert_eq!(manager.num_active(), 1);
    }

    #[test]
    fn changed_hash_replaces_and_drains_the_old_instance() {
        let manager = manager();
        manager.start_workers();
        manager
            .add_or_update_listener(
                "web",
                &stream_config(),
                true,
                &DefaultFilterChainBuilder,
                None,
            )
            .unwrap();

        let mut updated = stream_config();
        updated.reuse_port = true;
        assert!(manager
            .add_or_update_listener("web", &updated, true, &DefaultFilterChainBuilder, None)
            .unwrap());
        assert_eq!(manager.num_active(), 1);
        assert_eq!(manager.num_draining(), 1);
        assert!(manager.active_listener("web").unwrap().socket_factory().reuse_port());
    }

    #[test]
    fn drain_listeners_empties_active() {
        let manager = manager();
        manager
            .add_or_update_listener(
                "web",
                &stream_config(),
                false,
                &DefaultFilterChainBuilder,
                None,
            )
            .unwrap();
        let drained = manager.drain_listeners();
        assert_eq!(drained, ["web"]);
        assert_eq!(manager.num_active(), 0);
        assert_eq!(manager.num_draining(), 1);
    }

    #[test]
    fn remove_listener_by_name() {
        let manager = manager();
        manager
            .add_or_update_listener(
                "web",
                &stream_config(),
                false,
                &DefaultFilterChainBuilder,
                None,
            )
            .unwrap();
        assert!(manager.remove_listener("web"));
        assert!(!manager.remove_listener("web"));
        assert_eq!(manager.num_active(), 0);
    }
}
