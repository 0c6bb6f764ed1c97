pub(crate) mod auth;
mod handlers;
mod router;

pub use router::build_api_router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::engine::Engine;
use crate::core::lifecycle::LifecycleComponent;

pub struct ApiServer {
    state: AppState,
    addr: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct ApiServerConfig {
    pub engine: Arc<Engine>,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub admin_token: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub admin_token: Option<String>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.api_host, config.api_port),
            state: AppState {
                engine: config.engine,
                log_tx: config.log_tx,
                api_host: config.api_host,
                api_port: config.api_port,
                admin_token: config.admin_token,
            },
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    /// Binds before returning so a taken port fails startup.
    async fn on_start(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        let app = router::build_api_router(self.state.clone());
        let cancel = self.cancel.clone();
        let addr = self.addr.clone();

        self.handle = Some(tokio::spawn(async move {
            info!("API server running at http://{}", addr);
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("API server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
        Ok(())
    }
}

/// Loopback state over a test engine whose model always answers "done".
#[cfg(test)]
pub(crate) async fn test_state() -> (AppState, tempfile::TempDir) {
    use crate::core::llm::Response;
    use crate::core::llm::testing::ScriptedCompleter;

    let completer = Arc::new(ScriptedCompleter::always(Response::Text {
        content: "done".into(),
    }));
    let (engine, dir) = crate::core::engine::test_engine(completer).await;
    let (log_tx, _) = broadcast::channel(16);
    (
        AppState {
            engine: Arc::new(engine),
            log_tx,
            api_host: "127.0.0.1".to_string(),
            api_port: 8080,
            admin_token: None,
        },
        dir,
    )
}
