// src/state.rs
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing;

use crate::{
    config::AppConfig,
    errors::DispatchResult,
    services::{
        acceptance_timer::AcceptanceTimers,
        auth_service::{Authenticator, HttpAuthenticator, MockAuthenticator},
        dispatch_service::DispatchService,
        realtime_service::RealtimeHub,
        redis_store::RedisStore,
        store::{DispatchStore, MemoryStore},
        wallet_service::WalletService,
    },
};

pub struct AppState {
    pub dispatch: Arc<DispatchService>,
    pub wallet_service: Arc<WalletService>,
    pub realtime: RealtimeHub,
    pub auth: Arc<dyn Authenticator>,
    pub config: AppConfig,
}

impl AppState {
    pub async fn new(config: AppConfig, shutdown: CancellationToken) -> DispatchResult<Self> {
        let store: Arc<dyn DispatchStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url, config.store_timeout).await?),
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let auth: Arc<dyn Authenticator> = match &config.auth_service_url {
            Some(url) => Arc::new(HttpAuthenticator::new(url.clone(), config.store_timeout)?),
            None => {
                tracing::warn!("AUTH_SERVICE_URL not set, using mock authenticator");
                Arc::new(MockAuthenticator)
            }
        };

        Ok(Self::with_parts(config, store, auth, shutdown))
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn DispatchStore>,
        auth: Arc<dyn Authenticator>,
        shutdown: CancellationToken,
    ) -> Self {
        let realtime = RealtimeHub::new(config.realtime.clone());
        let wallet_service = Arc::new(WalletService::new(
            store.clone(),
            config.dispatch.fee_schedule.clone(),
        ));
        let dispatch = Arc::new(DispatchService::new(
            store,
            wallet_service.clone(),
            realtime.clone(),
            AcceptanceTimers::new(shutdown),
            config.dispatch.clone(),
        ));

        Self {
            dispatch,
            wallet_service,
            realtime,
            auth,
            config,
        }
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::services::store::fixtures;
    use crate::models::VehicleClass;

    /// In-memory state with mock auth and two Standard drivers on file
    pub async fn app_state() -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        for (driver, vehicle) in [("drv-1", "veh-1"), ("drv-2", "veh-2")] {
            store.put_driver(&fixtures::driver(driver, vehicle)).await.unwrap();
            store
                .put_vehicle(&fixtures::vehicle(vehicle, VehicleClass::Standard))
                .await
                .unwrap();
        }
        Arc::new(AppState::with_parts(
            AppConfig::default(),
            store,
            Arc::new(MockAuthenticator),
            CancellationToken::new(),
        ))
    }
}
