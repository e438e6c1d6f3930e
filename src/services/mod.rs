// src/services/mod.rs
pub mod acceptance_timer;
pub mod auth_service;
pub mod dispatch_service;
pub mod geo_matcher;
pub mod realtime_service;
pub mod redis_store;
pub mod store;
pub mod wallet_service;
