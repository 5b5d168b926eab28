use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::command::CommandInvocation;
use crate::context::Context;
use crate::error::Result;
use crate::event::Event;

/// Handles one routed command invocation.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: Context, invocation: CommandInvocation) -> Result<()>;
}

/// Receives events whose kind matches the listener's filter.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, ctx: Context, event: Arc<Event>) -> Result<()>;
}

/// Load/unload hooks for an extension.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_load(&self, _ctx: Context) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _ctx: Context) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Context, CommandInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: Context, invocation: CommandInvocation) -> Result<()> {
        (self)(ctx, invocation).await
    }
}

#[async_trait]
impl<F, Fut> EventListener for F
where
    F: Fn(Context, Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_event(&self, ctx: Context, event: Arc<Event>) -> Result<()> {
        (self)(ctx, event).await
    }
}
