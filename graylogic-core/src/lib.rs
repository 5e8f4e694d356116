//! # graylogic-core
//!
//! On-premises building-automation core: the real-time state pipeline and
//! authorization brain between field-protocol bridges (KNX), the entity
//! registry, a time-series store, and human-facing clients.
//!
//! ## Components
//!
//! - **knx** — pure codec (addresses, DPTs, telegrams), daemon supervision,
//!   and the KNX↔MQTT bridge
//! - **mqtt** — transport with reconnect, subscription replay, and the flat
//!   topic scheme
//! - **pipeline** — the single fan-out path: registry update, TSDB batch,
//!   state history, WebSocket broadcast
//! - **auth** — roles, Argon2id passwords, JWT rotation with family theft
//!   detection, panels, room scoping, rate limiting
//! - **api** — REST surface and the WebSocket hub
//!
//! ## Example
//!
//! ```rust,no_run
//! use graylogic_core::{config::Config, server};
//!
//! #[tokio::main]
//! async fn main() -> graylogic_core::error::Result<()> {
//!     let config = Config::load(None)?;
//!     server::init_tracing(&config);
//!     server::GrayLogicCore::build(config).await?.run().await
//! }
//! ```

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod knx;
pub mod middleware;
pub mod mqtt;
pub mod pipeline;
pub mod registry;
pub mod scene_engine;
pub mod server;
pub mod state;

pub use error::{Error, Result};
