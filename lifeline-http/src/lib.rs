//! HTTP transport for [`lifeline`]: implements the backend client and the
//! endpoint health probe over reqwest.

pub mod transport;
pub mod types;

pub use transport::HttpTransport;

use lifeline::{Lifeline, LifelineConfig};
use std::sync::Arc;

/// Open a [`Lifeline`] that talks HTTP to the configured endpoints.
pub async fn connect(config: LifelineConfig) -> Arc<Lifeline> {
    let transport = Arc::new(HttpTransport::new());
    Lifeline::open(config, transport.clone(), transport).await
}
