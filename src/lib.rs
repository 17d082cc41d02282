//! # Lifeline
//!
//! Client-side resilience layer for a backend that may be slow, flaky or
//! unreachable. Lifeline watches connectivity, fails over between backend
//! addresses, retries calls with bounded backoff, queues writes made while
//! offline and replays them later, and falls back across AI models when one
//! keeps failing.
//!
//! The transport is pluggable through [`facade::BackendClient`] and
//! [`endpoint::EndpointProber`]; the companion `lifeline-http` crate provides
//! a reqwest implementation of both.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lifeline::{ChatOptions, Lifeline, LifelineConfig};
//! # use std::sync::Arc;
//! # async fn run(
//! #     backend: Arc<dyn lifeline::BackendClient>,
//! #     prober: Arc<dyn lifeline::EndpointProber>,
//! # ) -> lifeline::Result<()> {
//! let config = LifelineConfig::load_or_default(std::path::Path::new("./data"));
//! let lifeline = Lifeline::open(config, backend, prober).await;
//! lifeline.start();
//!
//! // queued automatically if the backend is unreachable
//! let outcome = lifeline.save_file("src/main.py", "print('hi')").await?;
//! println!("{:?}", outcome);
//!
//! let reply = lifeline.chat("explain this file", ChatOptions::default()).await?;
//! println!("{} answered: {}", reply.model, reply.response);
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`connectivity`] | UNKNOWN / ONLINE / OFFLINE / DEGRADED state machine with subscriptions |
//! | [`endpoint`] | Ordered candidate addresses with a cached last-good endpoint |
//! | [`retry`] | Exponential backoff with jitter and error classification |
//! | [`cache`] | Key-value tier plus a structured tier with a memory fallback |
//! | [`queue`] | Durable per-resource FIFO of offline mutations |
//! | [`models`] | Per-model health tracking and fallback selection |
//! | [`facade`] | [`Lifeline`], composing all of the above |

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod facade;
pub mod models;
pub mod queue;
pub mod retry;
pub mod types;

pub use config::LifelineConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, ConnectivityStatus};
pub use endpoint::{EndpointProber, EndpointRegistry};
pub use error::{ErrorClass, LifelineError, Result};
pub use facade::{
    BackendClient, ChatOptions, ChatReply, ChatRequest, ChatResponse, HealthReport, Lifeline,
    LoadedFile, RequestContext, SaveOutcome,
};
pub use models::{ModelFallbackManager, ModelHealthRecord};
pub use queue::{OfflineQueue, QueueEntry, QueueStatus, ReplayReport};
pub use retry::{RetryExecutor, RetryPolicy};
pub use types::*;
