//! Wires the components into a running bot.
//!
//! `Client::new` builds the request pipeline, state store, registry and parser.
//! Extensions are loaded before `run`, which starts the dispatcher, the gateway
//! and the optional status API, then blocks until shutdown.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{create_status_router, StatusAppState};
use crate::cache::{RestFetcher, SqliteBacking, StateStore};
use crate::command::CommandParser;
use crate::config::{Credentials, HeraldConfig};
use crate::context::Context;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::gateway::GatewayConnection;
use crate::http::RequestPipeline;
use crate::registry::{Extension, Registry};
use crate::telemetry::{ErrorReporter, TracingReporter};

pub struct Client {
    config: HeraldConfig,
    credentials: Credentials,
    ctx: Context,
    parser: Arc<CommandParser>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Client {
    pub fn new(config: HeraldConfig, credentials: Credentials) -> Result<Self> {
        let http = Arc::new(RequestPipeline::new(config.http.clone(), &credentials)?);

        let mut store = StateStore::new().with_fetcher(Arc::new(RestFetcher::new(Arc::clone(&http))));
        if let Some(path) = &config.cache.database {
            let backing = SqliteBacking::open(path)?;
            info!(
                path = %path.display(),
                consistency = ?config.cache.consistency,
                "Cache backed by SQLite"
            );
            store = store.with_backing(Arc::new(backing), config.cache.consistency);
        }

        let registry = Arc::new(Registry::new(config.commands.collision));
        let ctx = Context::new(
            http,
            Arc::new(store),
            registry,
            config.commands.owners.iter().copied(),
        );
        let parser = Arc::new(CommandParser::new(&config.commands));

        Ok(Self {
            config,
            credentials,
            ctx,
            parser,
            reporter: Arc::new(TracingReporter),
        })
    }

    /// Replace the default tracing reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    /// Register an extension and run its load hooks.
    pub async fn load(&self, extension: Extension) -> Result<()> {
        self.ctx.registry.load(extension, &self.ctx).await
    }

    /// Run until ctrl-c, a clean gateway close, or a fatal error.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl_c signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run until `shutdown` resolves or the gateway stops.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let dispatcher = Dispatcher::start(
            &self.config.dispatcher,
            self.ctx.clone(),
            Arc::clone(&self.parser),
            Arc::clone(&self.reporter),
        );

        let mut gateway = GatewayConnection::new(
            self.config.gateway.clone(),
            self.credentials.clone(),
            Some(Arc::clone(&self.ctx.http)),
        );
        let closer = gateway.closer();

        let server = if self.config.api.enabled {
            Some(self.serve_status(gateway.state(), Arc::clone(&dispatcher)).await?)
        } else {
            None
        };

        let sink = Arc::clone(&dispatcher);
        let mut gateway_task = tokio::spawn(async move {
            match gateway.connect().await {
                Ok(session) => info!(session_id = ?session.session_id, "Connected to gateway"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Initial connect failed, retrying"),
            }
            gateway.run(&*sink).await
        });

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            result = &mut gateway_task => result,
            _ = &mut shutdown => {
                closer.close();
                gateway_task.await
            }
        };
        let outcome = outcome.unwrap_or_else(|e| {
            Err(Error::ConnectionLost {
                attempts: 0,
                reason: format!("gateway task failed: {}", e),
            })
        });

        dispatcher.shutdown(self.config.dispatcher.shutdown_grace()).await;
        for name in self.ctx.registry.extension_names() {
            self.ctx.registry.unload(&name, &self.ctx).await;
        }
        self.ctx.cache.flush().await;
        if let Some(server) = server {
            server.abort();
        }

        match &outcome {
            Ok(()) => info!("Herald stopped"),
            Err(e) => error!(error = %e, "Herald stopped with error"),
        }
        outcome
    }

    async fn serve_status(
        &self,
        connection: tokio::sync::watch::Receiver<crate::gateway::ConnectionState>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<JoinHandle<()>> {
        let router = create_status_router(StatusAppState {
            connection,
            dispatcher,
            registry: Arc::clone(&self.ctx.registry),
            cache: Arc::clone(&self.ctx.cache),
        });
        let port = self.config.api.port;
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .map_err(|e| Error::Config(format!("failed to bind status API port {}: {}", port, e)))?;
        info!(port = port, "Status API listening");

        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "Status API server error");
            }
        }))
    }
}
