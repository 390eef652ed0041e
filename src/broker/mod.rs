//! Rendezvous protocol client.
//!
//! The broker pairs waiting proxies with clients. A proxy long-polls
//! `POST <base>proxy` until the broker hands it a client's offer (200) or
//! releases the poll empty-handed (504), then delivers its answer with
//! `POST <base>answer`. Both requests carry the session id in the
//! `X-Session-ID` header.
//!
//! The HTTP layer sits behind [`BrokerTransport`] so the protocol can be
//! driven by any client; [`http::HttpTransport`] is the reqwest one.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::proxy::SessionId;
use crate::transport::SessionDescription;

pub mod http;

/// Header carrying the session id on every broker request.
pub const SESSION_ID_HEADER: &str = "X-Session-ID";

/// Status shown when the broker answers with something unexpected.
pub const BROKER_FAILURE_STATUS: &str = " failure. Please refresh.";

/// Status and body of a broker reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerResponse {
    /// Status code
    pub status: u16,
    /// Response body
    pub body: String,
}

impl BrokerResponse {
    /// Create a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Issues POST requests to the broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// POST `body` to `url` with the session id header set.
    ///
    /// An `Err` means the request could not be opened or sent at all; any
    /// status the broker returns is an `Ok`.
    async fn post(&self, url: &str, session_id: &str, body: String) -> Result<BrokerResponse>;
}

/// How the broker took an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Delivered to the client (200)
    Delivered,
    /// The client gave up before the answer arrived (410)
    Gone,
}

/// Client for one broker.
#[derive(Clone)]
pub struct Broker {
    url: String,
    transport: Arc<dyn BrokerTransport>,
}

impl Broker {
    /// Create a client for the broker at `url`.
    pub fn new(url: &str, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            url: normalize_url(url),
            transport,
        }
    }

    /// Normalised base URL, always ending in `/`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register as available and wait for a client's offer.
    ///
    /// There is no client-side timeout; the broker ends the long-poll itself.
    pub async fn request_offer(&self, id: &SessionId) -> Result<String> {
        let url = format!("{}proxy", self.url);
        tracing::debug!(session = %id, "polling broker at {}", url);

        let response = self
            .transport
            .post(&url, id.as_str(), id.to_string())
            .await
            .map_err(|e| {
                tracing::warn!(session = %id, "broker poll could not be sent: {}", e);
                e
            })?;

        match response.status {
            200 => {
                tracing::debug!(session = %id, "broker returned an offer");
                Ok(response.body)
            }
            504 => {
                tracing::info!(session = %id, "broker timed out without a client");
                Err(Error::BrokerTimeout)
            }
            status => {
                tracing::warn!(session = %id, status, "unexpected broker response");
                Err(Error::BrokerUnexpected(status))
            }
        }
    }

    /// Deliver the local answer for `id`. Not retried.
    pub async fn submit_answer(
        &self,
        id: &SessionId,
        answer: &SessionDescription,
    ) -> Result<AnswerOutcome> {
        let url = format!("{}answer", self.url);
        tracing::debug!(session = %id, "posting answer to {}", url);

        let response = self
            .transport
            .post(&url, id.as_str(), answer.to_json())
            .await
            .map_err(|e| {
                tracing::warn!(session = %id, "broker answer could not be sent: {}", e);
                e
            })?;

        match response.status {
            200 => Ok(AnswerOutcome::Delivered),
            410 => {
                tracing::info!(session = %id, "client went away before the answer arrived");
                Ok(AnswerOutcome::Gone)
            }
            status => {
                tracing::warn!(session = %id, status, "broker rejected answer");
                Err(Error::BrokerUnexpected(status))
            }
        }
    }
}

/// Give `url` an explicit scheme and a trailing `/`.
///
/// `localhost` URLs default to plain `http://`, anything else without a
/// scheme to `https://`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let mut out = if url.starts_with("localhost") {
        format!("http://{}", url)
    } else if !url.starts_with("http") {
        format!("https://{}", url)
    } else {
        url.to_string()
    };
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrokerTransport;

    fn broker_with(transport: &Arc<FakeBrokerTransport>) -> Broker {
        Broker::new("broker.test", Arc::clone(transport) as Arc<dyn BrokerTransport>)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("broker.test"), "https://broker.test/");
        assert_eq!(normalize_url("localhost:8080"), "http://localhost:8080/");
        assert_eq!(normalize_url("http://10.0.0.1/"), "http://10.0.0.1/");
        assert_eq!(normalize_url("https://b.example/path"), "https://b.example/path/");
    }

    #[tokio::test]
    async fn test_request_offer_ok() {
        let transport = Arc::new(FakeBrokerTransport::new());
        transport.push_response(BrokerResponse::new(200, "fake offer"));
        let broker = broker_with(&transport);
        let id = SessionId::generate();

        let offer = broker.request_offer(&id).await.unwrap();
        assert_eq!(offer, "fake offer");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://broker.test/proxy");
        assert_eq!(requests[0].session_id, id.as_str());
        assert_eq!(requests[0].body, id.as_str());
    }

    #[tokio::test]
    async fn test_request_offer_timeout() {
        let transport = Arc::new(FakeBrokerTransport::new());
        transport.push_response(BrokerResponse::new(504, ""));
        let broker = broker_with(&transport);

        let err = broker.request_offer(&SessionId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::BrokerTimeout));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_request_offer_unexpected() {
        let transport = Arc::new(FakeBrokerTransport::new());
        transport.push_response(BrokerResponse::new(1337, ""));
        let broker = broker_with(&transport);

        let err = broker.request_offer(&SessionId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnexpected(1337)));
    }

    #[tokio::test]
    async fn test_request_offer_send_failure() {
        let transport = Arc::new(FakeBrokerTransport::new());
        transport.push_error("permission denied");
        let broker = broker_with(&transport);

        let err = broker.request_offer(&SessionId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::BrokerRequest(_)));
    }

    #[tokio::test]
    async fn test_submit_answer_statuses() {
        let transport = Arc::new(FakeBrokerTransport::new());
        transport.push_response(BrokerResponse::new(200, ""));
        transport.push_response(BrokerResponse::new(410, ""));
        transport.push_response(BrokerResponse::new(500, ""));
        let broker = broker_with(&transport);
        let id = SessionId::generate();
        let answer = SessionDescription::answer("v=0");

        assert_eq!(
            broker.submit_answer(&id, &answer).await.unwrap(),
            AnswerOutcome::Delivered
        );
        assert_eq!(
            broker.submit_answer(&id, &answer).await.unwrap(),
            AnswerOutcome::Gone
        );
        assert!(matches!(
            broker.submit_answer(&id, &answer).await,
            Err(Error::BrokerUnexpected(500))
        ));

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].url, "https://broker.test/answer");
        assert_eq!(requests[0].body, r#"{"type":"answer","sdp":"v=0"}"#);
    }
}
