// src/aggregator.rs
//
// The connection manager. Owns every provider the gateway aggregates:
// downstream clients (child processes, HTTP endpoints) and in-process
// internal providers, behind one handle type so the rest of the gateway
// cannot tell them apart. Failures stay contained to their provider.

use crate::catalog::{Catalog, CatalogChange, CatalogSnapshot, ProviderListing};
use crate::client::{ConnectionState, ConnectionStatus, DownstreamClient};
use crate::config::ServerConfig;
use crate::confirm::{Confirmation, ConfirmationRouter};
use crate::error::{GatewayError, Result};
use crate::internal::{self, ToolOutcome, ToolProvider};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cap on concurrent handshakes during start-up, bounding the fork storm.
pub const DEFAULT_HANDSHAKE_CONCURRENCY: usize = 8;

#[derive(Clone)]
enum ProviderHandle {
    Remote(Arc<DownstreamClient>),
    Internal(Arc<dyn ToolProvider>),
}

pub struct MCPAggregator {
    protocol_version: String,
    handshake_limit: usize,
    /// Per-provider inflight cap; calls beyond it fail fast with
    /// `ProviderBusy`. `None` keeps the default unbounded behavior.
    high_water_mark: Option<usize>,
    catalog: Catalog,
    providers: RwLock<HashMap<String, ProviderHandle>>,
    /// Last known listing per provider, kept so a dead provider's tools
    /// stay visible (marked unavailable) instead of vanishing.
    listings: RwLock<HashMap<String, ProviderListing>>,
    confirm: Arc<ConfirmationRouter>,
}

impl MCPAggregator {
    pub fn new(protocol_version: String, confirm: Arc<ConfirmationRouter>) -> Self {
        MCPAggregator {
            protocol_version,
            handshake_limit: DEFAULT_HANDSHAKE_CONCURRENCY,
            high_water_mark: None,
            catalog: Catalog::new(),
            providers: RwLock::new(HashMap::new()),
            listings: RwLock::new(HashMap::new()),
            confirm,
        }
    }

    pub fn with_handshake_limit(mut self, limit: usize) -> Self {
        self.handshake_limit = limit.max(1);
        self
    }

    pub fn with_high_water_mark(mut self, mark: usize) -> Self {
        self.high_water_mark = Some(mark.max(1));
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn confirmations(&self) -> Arc<ConfirmationRouter> {
        self.confirm.clone()
    }

    /// Register an in-process provider. Indistinguishable from a child
    /// server once it is in the catalog.
    pub async fn register_internal(
        &self,
        provider: Arc<dyn ToolProvider>,
    ) -> Result<CatalogChange> {
        let name = provider.name().to_string();
        let listing = internal::listing_for(provider.as_ref()).await?;
        self.providers
            .write()
            .await
            .insert(name.clone(), ProviderHandle::Internal(provider));
        self.listings.write().await.insert(name, listing);
        Ok(self.rebuild_catalog().await)
    }

    /// Spawn and handshake every configured provider. Handshakes run
    /// concurrently under the handshake cap; each provider's tools are
    /// merged into the catalog as its listing arrives. A provider that
    /// fails to come up is recorded as Failed and skipped — the gateway
    /// stays up.
    pub async fn initialize(&self, configs: &HashMap<String, ServerConfig>) {
        let semaphore = Arc::new(Semaphore::new(self.handshake_limit));
        let mut tasks = FuturesUnordered::new();

        for (name, config) in configs {
            let semaphore = semaphore.clone();
            let name = name.clone();
            let config = config.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire().await;
                self.start_provider(name, config).await
            });
        }

        while tasks.next().await.is_some() {
            // Merge as they arrive: every finished handshake refreshes the
            // published snapshot so early tools are findable immediately.
            self.rebuild_catalog().await;
        }

        let snapshot = self.catalog.snapshot();
        info!(
            providers = configs.len(),
            tools = snapshot.len(),
            fingerprint = %snapshot.fingerprint(),
            "aggregator initialized"
        );
    }

    async fn start_provider(&self, name: String, config: ServerConfig) {
        let client = Arc::new(DownstreamClient::new(
            name.clone(),
            config,
            self.protocol_version.clone(),
        ));
        self.providers
            .write()
            .await
            .insert(name.clone(), ProviderHandle::Remote(client.clone()));

        if let Err(e) = client.connect().await {
            warn!(provider = %name, "provider failed to start: {e}");
            return;
        }
        match client.list_tools().await {
            Ok(listing) => {
                self.listings.write().await.insert(name, listing);
            }
            Err(e) => warn!(provider = %name, "tools/list failed: {e}"),
        }
    }

    /// Rebuild the catalog snapshot from the cached listings, refreshing
    /// availability from live connection state.
    async fn rebuild_catalog(&self) -> CatalogChange {
        let providers = self.providers.read().await;
        let mut listings: Vec<ProviderListing> =
            self.listings.read().await.values().cloned().collect();
        for listing in &mut listings {
            listing.available = match providers.get(&listing.provider) {
                Some(ProviderHandle::Remote(client)) => client.state() == ConnectionState::Ready,
                Some(ProviderHandle::Internal(_)) => true,
                None => false,
            };
        }
        drop(providers);
        self.catalog.install(CatalogSnapshot::build(&listings))
    }

    /// The flattened catalog, stamped with its fingerprint.
    pub async fn get_tools(&self) -> CatalogSnapshot {
        // Availability may have drifted since the last rebuild.
        self.rebuild_catalog().await;
        self.catalog.snapshot()
    }

    /// Whether a provider would accept a call right now.
    pub async fn is_ready(&self, provider: &str) -> bool {
        match self.providers.read().await.get(provider) {
            Some(ProviderHandle::Remote(client)) => matches!(
                client.state(),
                ConnectionState::Ready | ConnectionState::Degraded
            ),
            Some(ProviderHandle::Internal(_)) => true,
            None => false,
        }
    }

    pub async fn provider_status(&self, provider: &str) -> Option<ConnectionStatus> {
        match self.providers.read().await.get(provider) {
            Some(ProviderHandle::Remote(client)) => Some(client.status()),
            _ => None,
        }
    }

    /// Route one tool call to its provider.
    pub async fn call_tool(
        &self,
        provider: &str,
        tool: &str,
        params: Value,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let handle = self
            .providers
            .read()
            .await
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::ToolNotFound(format!("{provider}:{tool}")))?;

        match handle {
            ProviderHandle::Remote(client) => {
                if let Some(mark) = self.high_water_mark {
                    if client.inflight() >= mark {
                        return Err(GatewayError::ProviderBusy(provider.to_string()));
                    }
                }
                client.call_tool(tool, params, deadline, cancel).await
            }
            ProviderHandle::Internal(plugin) => {
                let call = self.drive_internal(plugin, tool, params);
                tokio::select! {
                    outcome = call => outcome,
                    _ = tokio::time::sleep(deadline) => Err(GatewayError::Timeout),
                    _ = cancelled(cancel) => Err(GatewayError::Cancelled),
                }
            }
        }
    }

    /// Drive an internal tool, looping through any input requests via the
    /// confirmation channel.
    async fn drive_internal(
        &self,
        plugin: Arc<dyn ToolProvider>,
        tool: &str,
        params: Value,
    ) -> Result<Value> {
        let mut outcome = plugin.call_tool(tool, params).await?;
        loop {
            match outcome {
                ToolOutcome::Done(value) => return Ok(value),
                ToolOutcome::InputRequest {
                    token,
                    message,
                    schema,
                } => match self.confirm.confirm(&message, schema).await? {
                    Confirmation::Accept(content) => {
                        outcome = plugin
                            .resume(token, content.unwrap_or(Value::Null))
                            .await?;
                    }
                    Confirmation::Decline | Confirmation::Cancel => {
                        return Err(GatewayError::Cancelled);
                    }
                    Confirmation::Pending => {
                        return Err(GatewayError::InvalidRequest(
                            "consent dialog still pending; answer it and retry".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Apply a new provider set: close removed providers, spawn added ones,
    /// leave unchanged ones as they are but refresh their tool listings.
    pub async fn reload(&self, configs: &HashMap<String, ServerConfig>) -> CatalogChange {
        let current: HashMap<String, ServerConfig> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .filter_map(|(name, handle)| match handle {
                    ProviderHandle::Remote(client) => Some((name.clone(), client.config().clone())),
                    ProviderHandle::Internal(_) => None,
                })
                .collect()
        };

        let removed: HashSet<String> = current
            .keys()
            .filter(|name| !configs.contains_key(*name))
            .cloned()
            .collect();
        for name in &removed {
            info!(provider = %name, "provider removed on reload");
            self.remove_provider(name).await;
        }

        for (name, config) in configs {
            match current.get(name) {
                None => {
                    info!(provider = %name, "provider added on reload");
                    self.start_provider(name.clone(), config.clone()).await;
                }
                Some(old) if old != config => {
                    info!(provider = %name, "provider config changed; restarting");
                    self.remove_provider(name).await;
                    self.start_provider(name.clone(), config.clone()).await;
                }
                Some(_) => {
                    // Unchanged: keep the connection, refresh the listing.
                    let handle = self.providers.read().await.get(name).cloned();
                    if let Some(ProviderHandle::Remote(client)) = handle {
                        if client.state() == ConnectionState::Ready {
                            match client.list_tools().await {
                                Ok(listing) => {
                                    self.listings.write().await.insert(name.clone(), listing);
                                }
                                Err(e) => warn!(provider = %name, "reload listing failed: {e}"),
                            }
                        }
                    }
                }
            }
        }

        self.rebuild_catalog().await
    }

    async fn remove_provider(&self, name: &str) {
        let handle = self.providers.write().await.remove(name);
        if let Some(ProviderHandle::Remote(client)) = handle {
            client.close().await;
        }
        self.listings.write().await.remove(name);
    }

    /// Concurrent shutdown of every remote provider.
    pub async fn close(&self) {
        let clients: Vec<Arc<DownstreamClient>> = {
            let providers = self.providers.read().await;
            providers
                .values()
                .filter_map(|handle| match handle {
                    ProviderHandle::Remote(client) => Some(client.clone()),
                    ProviderHandle::Internal(_) => None,
                })
                .collect()
        };
        futures::future::join_all(clients.iter().map(|client| client.close())).await;
        info!("aggregator closed");
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
