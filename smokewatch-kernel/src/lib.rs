//! Noyau d'ingestion smokewatch : abonnement MQTT aux capteurs température
//! et fumée, parsing strict, persistance append-only et alertes fumée.

pub mod alerts;
pub mod config;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod ports;
pub mod recipients;
pub mod subscription;
