use crate::config::Config;
use crate::crm::{BitrixClient, CrmApi};
use crate::handler::middleware::request_log::log_requests;
use crate::ura::Classifier;
use anyhow::Result;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub classifier: Classifier,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

#[derive(Default)]
pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub crm: Option<Arc<dyn CrmApi>>,
    pub token: Option<CancellationToken>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the Bitrix REST client, mostly for tests.
    pub fn crm(mut self, crm: Arc<dyn CrmApi>) -> Self {
        self.crm = Some(crm);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let crm = match self.crm {
            Some(crm) => crm,
            None => Arc::new(BitrixClient::new(&config.bitrix)) as Arc<dyn CrmApi>,
        };
        let classifier = Classifier::new(crm, &config)?;
        Ok(Arc::new(AppStateInner {
            config,
            classifier,
            token: self.token.unwrap_or_default(),
        }))
    }
}

pub fn create_router(state: AppState) -> Router {
    let skip_paths = Arc::new(state.config.access_log_skip.clone());
    crate::handler::router()
        .with_state(state)
        .layer(middleware::from_fn_with_state(skip_paths, log_requests))
}

pub async fn run(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on http://{}", addr);
    serve(state, listener).await
}

/// Serves the webhook on an already bound listener until the state's token
/// is cancelled.
pub async fn serve(state: AppState, listener: TcpListener) -> Result<()> {
    let token = state.token.clone();
    let app = create_router(state);
    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            if let Err(e) = http_result {
                tracing::error!("Server error: {}", e);
                return Err(anyhow::anyhow!("Server error: {}", e));
            }
            info!("Server shut down gracefully");
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    Ok(())
}
