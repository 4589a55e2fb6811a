// SPDX-License-Identifier: MIT OR Apache-2.0
//! The upstream API client capability carried by each [`crate::model::ClientLease`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// One client's access to the upstream public procurement API.
///
/// A real implementation wraps a `reqwest::Client` plus whatever
/// cookie/session state the upstream demands; tests substitute an
/// in-memory fake. Exactly one lease holder calls these methods at a time.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Fetch the full document for `rid`, returning its opaque JSON body
    /// (the `data` field of the upstream envelope, already unwrapped).
    async fn get_resource_item(&self, rid: &str) -> Result<Value, FetchError>;

    /// Force a new session/cookie for this client.
    async fn renew_cookies(&self) -> Result<(), FetchError>;

    /// Drop the current session cookies without renewing.
    async fn clear_cookies(&self) -> Result<(), FetchError>;
}

/// A `reqwest`-backed [`ApiTransport`].
///
/// The upstream API returns `{"data": {...}}` on success; non-2xx statuses
/// are classified into [`FetchError`] variants by status code, and 410/404
/// are distinguished from the generic `RequestFailed` bucket because the
/// fetcher treats them specially.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    resource: String,
}

impl HttpTransport {
    /// Build a transport hitting `base_url` for the plural `resource` kind,
    /// e.g. `resource = "tenders"`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            resource: resource.into(),
        }
    }

    fn item_url(&self, rid: &str) -> String {
        format!("{}/{}/{}", self.base_url.trim_end_matches('/'), self.resource, rid)
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn get_resource_item(&self, rid: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(self.item_url(rid))
            .send()
            .await
            .map_err(|e| FetchError::Other(e.into()))?;

        let status = response.status();
        if status.as_u16() == 410 {
            return Err(FetchError::ResourceGone);
        }
        if status.as_u16() == 404 {
            return Err(FetchError::ResourceNotFound);
        }
        if !status.is_success() {
            return Err(FetchError::RequestFailed {
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        body.get("data")
            .cloned()
            .ok_or_else(|| FetchError::InvalidResponse("missing 'data' field".to_string()))
    }

    async fn renew_cookies(&self) -> Result<(), FetchError> {
        let response = self
            .client
            .head(&self.base_url)
            .send()
            .await
            .map_err(|e| FetchError::Other(e.into()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(FetchError::RequestFailed {
                status: response.status().as_u16(),
            })
        }
    }

    async fn clear_cookies(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory [`ApiTransport`] used by unit and integration tests.

    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// A scripted response for one call.
    pub enum Scripted {
        /// Return this document.
        Ok(Value),
        /// Fail with this error.
        Err(FetchError),
    }

    /// A transport whose `get_resource_item` responses are scripted in
    /// advance, FIFO.
    pub struct FakeTransport {
        responses: Mutex<VecDeque<Scripted>>,
        pub renew_calls: Mutex<u32>,
        pub clear_calls: Mutex<u32>,
        pub renew_should_fail: bool,
    }

    impl FakeTransport {
        /// Build a fake with a queue of scripted responses.
        pub fn new(responses: Vec<Scripted>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                renew_calls: Mutex::new(0),
                clear_calls: Mutex::new(0),
                renew_should_fail: false,
            }
        }
    }

    #[async_trait]
    impl ApiTransport for FakeTransport {
        async fn get_resource_item(&self, _rid: &str) -> Result<Value, FetchError> {
            let mut responses = self.responses.lock().await;
            match responses.pop_front() {
                Some(Scripted::Ok(doc)) => Ok(doc),
                Some(Scripted::Err(e)) => Err(e),
                None => Err(FetchError::Other(anyhow::anyhow!("no more scripted responses"))),
            }
        }

        async fn renew_cookies(&self) -> Result<(), FetchError> {
            *self.renew_calls.lock().await += 1;
            if self.renew_should_fail {
                Err(FetchError::RequestFailed { status: 500 })
            } else {
                Ok(())
            }
        }

        async fn clear_cookies(&self) -> Result<(), FetchError> {
            *self.clear_calls.lock().await += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_transport_replays_scripted_responses_in_order() {
        let transport = FakeTransport::new(vec![
            Scripted::Ok(serde_json::json!({"id": "a"})),
            Scripted::Err(FetchError::ResourceGone),
        ]);
        assert!(transport.get_resource_item("a").await.is_ok());
        assert!(matches!(
            transport.get_resource_item("a").await,
            Err(FetchError::ResourceGone)
        ));
    }

    #[tokio::test]
    async fn fake_transport_counts_cookie_calls() {
        let transport = FakeTransport::new(vec![]);
        transport.renew_cookies().await.unwrap();
        transport.clear_cookies().await.unwrap();
        assert_eq!(*transport.renew_calls.lock().await, 1);
        assert_eq!(*transport.clear_calls.lock().await, 1);
    }
}
