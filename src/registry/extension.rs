use std::future::Future;
use std::sync::Arc;

use super::handler::{CommandHandler, EventListener, LifecycleHook};
use crate::command::CommandInvocation;
use crate::context::Context;
use crate::error::Result;
use crate::event::{Event, EventKind};

/// How a command trigger is matched against the invoked name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriggerPattern {
    Exact(String),
    /// Matches any invoked name starting with this text
    Prefix(String),
}

impl TriggerPattern {
    pub fn text(&self) -> &str {
        match self {
            TriggerPattern::Exact(s) | TriggerPattern::Prefix(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub pattern: TriggerPattern,
    pub description: String,
}

/// Which events a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn kind(kind: EventKind) -> Self {
        EventFilter::Kinds(vec![kind])
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// One thing an extension can contribute.
#[derive(Clone)]
pub enum Capability {
    Command(CommandSpec, Arc<dyn CommandHandler>),
    Listener(EventFilter, Arc<dyn EventListener>),
    Lifecycle(Arc<dyn LifecycleHook>),
}

/// A named unit of handlers registered and removed together.
#[derive(Clone)]
pub struct Extension {
    pub name: String,
    pub capabilities: Vec<Capability>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Add an exact-match command. Triggers are case-insensitive.
    pub fn command<F, Fut>(self, trigger: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Context, CommandInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.capability(Capability::Command(
            CommandSpec {
                pattern: TriggerPattern::Exact(trigger.to_lowercase()),
                description: description.to_string(),
            },
            Arc::new(handler),
        ))
    }

    /// Add a command matched by name prefix.
    pub fn prefix_command<F, Fut>(self, prefix: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Context, CommandInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.capability(Capability::Command(
            CommandSpec {
                pattern: TriggerPattern::Prefix(prefix.to_lowercase()),
                description: description.to_string(),
            },
            Arc::new(handler),
        ))
    }

    pub fn listener<F, Fut>(self, filter: EventFilter, handler: F) -> Self
    where
        F: Fn(Context, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.capability(Capability::Listener(filter, Arc::new(handler)))
    }

    pub fn lifecycle(self, hook: impl LifecycleHook + 'static) -> Self {
        self.capability(Capability::Lifecycle(Arc::new(hook)))
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandSpec> {
        self.capabilities.iter().filter_map(|c| match c {
            Capability::Command(spec, _) => Some(spec),
            _ => None,
        })
    }

    pub fn hooks(&self) -> impl Iterator<Item = &Arc<dyn LifecycleHook>> {
        self.capabilities.iter().filter_map(|c| match c {
            Capability::Lifecycle(hook) => Some(hook),
            _ => None,
        })
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}
