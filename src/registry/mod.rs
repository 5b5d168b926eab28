// Extension registry: trigger routing and event listeners.
//
// Routes hold Arc handles to their handlers, so an extension unregistered while one
// of its handlers is running only stops receiving new work.

mod extension;
mod handler;

pub use extension::{Capability, CommandSpec, EventFilter, Extension, TriggerPattern};
pub use handler::{CommandHandler, EventListener, LifecycleHook};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::command::CommandInvocation;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::EventKind;

/// What happens when two extensions claim the same trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Registration fails with `DuplicateTrigger`
    #[default]
    Reject,
    /// The earlier route stays active; later ones are shadowed until it is removed
    FirstWins,
}

/// A routed command handler.
#[derive(Clone)]
pub struct Route {
    pub extension: Arc<str>,
    pub spec: CommandSpec,
    pub handler: Arc<dyn CommandHandler>,
    order: u64,
}

/// A registered event listener.
#[derive(Clone)]
pub struct ListenerRoute {
    pub extension: Arc<str>,
    pub filter: EventFilter,
    pub handler: Arc<dyn EventListener>,
}

#[derive(Default)]
struct Routing {
    /// Registration order
    extensions: Vec<Arc<Extension>>,
    exact: HashMap<String, Vec<Route>>,
    prefix: HashMap<String, Vec<Route>>,
    listeners: Vec<ListenerRoute>,
    next_order: u64,
}

impl Routing {
    fn table(&self, pattern: &TriggerPattern) -> &HashMap<String, Vec<Route>> {
        match pattern {
            TriggerPattern::Exact(_) => &self.exact,
            TriggerPattern::Prefix(_) => &self.prefix,
        }
    }

    fn table_mut(&mut self, pattern: &TriggerPattern) -> &mut HashMap<String, Vec<Route>> {
        match pattern {
            TriggerPattern::Exact(_) => &mut self.exact,
            TriggerPattern::Prefix(_) => &mut self.prefix,
        }
    }
}

/// Name-keyed registry of extensions and their capabilities.
pub struct Registry {
    policy: CollisionPolicy,
    routing: RwLock<Routing>,
}

impl Registry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            routing: RwLock::new(Routing::default()),
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Add an extension. Validated completely before anything is changed, so a
    /// rejected extension leaves the registry untouched.
    pub fn register(&self, extension: Extension) -> Result<Arc<Extension>> {
        let mut routing = self.routing.write().unwrap();

        if routing.extensions.iter().any(|e| e.name == extension.name) {
            return Err(Error::DuplicateExtension(extension.name));
        }

        if self.policy == CollisionPolicy::Reject {
            let mut claimed: Vec<&TriggerPattern> = Vec::new();
            for spec in extension.commands() {
                if claimed.contains(&&spec.pattern) {
                    return Err(Error::DuplicateTrigger {
                        trigger: spec.pattern.text().to_string(),
                        existing: extension.name.clone(),
                    });
                }
                if let Some(existing) = routing
                    .table(&spec.pattern)
                    .get(spec.pattern.text())
                    .and_then(|routes| routes.first())
                {
                    return Err(Error::DuplicateTrigger {
                        trigger: spec.pattern.text().to_string(),
                        existing: existing.extension.to_string(),
                    });
                }
                claimed.push(&spec.pattern);
            }
        }

        let extension = Arc::new(extension);
        let name: Arc<str> = Arc::from(extension.name.as_str());

        for capability in &extension.capabilities {
            match capability {
                Capability::Command(spec, handler) => {
                    let order = routing.next_order;
                    routing.next_order += 1;
                    let routes = routing
                        .table_mut(&spec.pattern)
                        .entry(spec.pattern.text().to_string())
                        .or_default();
                    if let Some(active) = routes.first() {
                        warn!(
                            trigger = %spec.pattern.text(),
                            extension = %name,
                            active = %active.extension,
                            "Trigger shadowed by earlier registration"
                        );
                    }
                    routes.push(Route {
                        extension: Arc::clone(&name),
                        spec: spec.clone(),
                        handler: Arc::clone(handler),
                        order,
                    });
                }
                Capability::Listener(filter, handler) => {
                    routing.listeners.push(ListenerRoute {
                        extension: Arc::clone(&name),
                        filter: filter.clone(),
                        handler: Arc::clone(handler),
                    });
                }
                Capability::Lifecycle(_) => {}
            }
        }

        routing.extensions.push(Arc::clone(&extension));
        info!(
            extension = %name,
            commands = extension.commands().count(),
            "Extension registered"
        );
        Ok(extension)
    }

    /// Remove an extension and every route it contributed. Handlers already
    /// dispatched keep running.
    pub fn unregister(&self, name: &str) -> Option<Arc<Extension>> {
        let mut guard = self.routing.write().unwrap();
        let routing = &mut *guard;
        let index = routing.extensions.iter().position(|e| e.name == name)?;
        let extension = routing.extensions.remove(index);

        for table in [&mut routing.exact, &mut routing.prefix] {
            table.retain(|_, routes| {
                routes.retain(|r| &*r.extension != name);
                !routes.is_empty()
            });
        }
        routing.listeners.retain(|l| &*l.extension != name);

        info!(extension = %name, "Extension unregistered");
        Some(extension)
    }

    /// Register and run the extension's load hooks. A failing hook rolls the
    /// registration back.
    pub async fn load(&self, extension: Extension, ctx: &Context) -> Result<()> {
        let extension = self.register(extension)?;
        for hook in extension.hooks() {
            if let Err(e) = hook.on_load(ctx.clone()).await {
                self.unregister(&extension.name);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unregister and run the extension's unload hooks. Returns false if no such
    /// extension was registered.
    pub async fn unload(&self, name: &str, ctx: &Context) -> bool {
        let Some(extension) = self.unregister(name) else {
            return false;
        };
        for hook in extension.hooks() {
            if let Err(e) = hook.on_unload(ctx.clone()).await {
                warn!(extension = %name, error = %e, "Unload hook failed");
            }
        }
        true
    }

    /// Handlers for an invocation, in the order they should run.
    ///
    /// An exact trigger wins outright. Otherwise every matching prefix route is
    /// returned, longest prefix first, then registration order.
    pub fn route(&self, invocation: &CommandInvocation) -> Vec<Route> {
        let routing = self.routing.read().unwrap();
        let trigger = invocation.trigger.to_lowercase();

        if let Some(active) = routing.exact.get(&trigger).and_then(|r| r.first()) {
            return vec![active.clone()];
        }

        let mut matches: Vec<(usize, Route)> = routing
            .prefix
            .iter()
            .filter(|(prefix, _)| trigger.starts_with(prefix.as_str()))
            .filter_map(|(prefix, routes)| routes.first().map(|r| (prefix.len(), r.clone())))
            .collect();
        matches.sort_by(|(a_len, a), (b_len, b)| b_len.cmp(a_len).then(a.order.cmp(&b.order)));
        matches.into_iter().map(|(_, route)| route).collect()
    }

    /// Listeners interested in `kind`, in registration order.
    pub fn listeners_for(&self, kind: EventKind) -> Vec<ListenerRoute> {
        let routing = self.routing.read().unwrap();
        routing
            .listeners
            .iter()
            .filter(|l| l.filter.matches(kind))
            .cloned()
            .collect()
    }

    /// Active commands as (trigger, description, extension), sorted by trigger.
    pub fn commands(&self) -> Vec<(TriggerPattern, String, String)> {
        let routing = self.routing.read().unwrap();
        let mut commands: Vec<_> = routing
            .exact
            .values()
            .chain(routing.prefix.values())
            .filter_map(|routes| routes.first())
            .map(|r| {
                (
                    r.spec.pattern.clone(),
                    r.spec.description.clone(),
                    r.extension.to_string(),
                )
            })
            .collect();
        commands.sort_by(|a, b| a.0.text().cmp(b.0.text()));
        commands
    }

    /// Every registered trigger with the extensions claiming it, active first.
    pub fn triggers(&self) -> Vec<(TriggerPattern, Vec<String>)> {
        let routing = self.routing.read().unwrap();
        let mut triggers: Vec<_> = routing
            .exact
            .iter()
            .map(|(t, routes)| (TriggerPattern::Exact(t.clone()), routes))
            .chain(
                routing
                    .prefix
                    .iter()
                    .map(|(t, routes)| (TriggerPattern::Prefix(t.clone()), routes)),
            )
            .map(|(pattern, routes)| {
                (
                    pattern,
                    routes.iter().map(|r| r.extension.to_string()).collect(),
                )
            })
            .collect();
        triggers.sort_by(|a, b| a.0.text().cmp(b.0.text()));
        triggers
    }

    pub fn extension_names(&self) -> Vec<String> {
        let routing = self.routing.read().unwrap();
        routing.extensions.iter().map(|e| e.name.clone()).collect()
    }

    pub fn listener_count(&self) -> usize {
        self.routing.read().unwrap().listeners.len()
    }
}
