//! Broker transport over reqwest.

use async_trait::async_trait;

use super::{BrokerResponse, BrokerTransport, SESSION_ID_HEADER};
use crate::error::{Error, Result};

/// HTTPS broker transport.
///
/// No request timeout is set: the proxy poll is a long-poll that the broker
/// ends with a 504 on its own schedule.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("snowflake-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::broker(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerTransport for HttpTransport {
    async fn post(&self, url: &str, session_id: &str, body: String) -> Result<BrokerResponse> {
        let response = self
            .client
            .post(url)
            .header(SESSION_ID_HEADER, session_id)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::broker(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::broker(e.to_string()))?;

        Ok(BrokerResponse { status, body })
    }
}
