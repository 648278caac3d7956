use crate::traits::IndexNotifier;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Posts a "refresh index" event to the search service. Requests run on
/// spawned tasks; `flush` lets a short-lived process wait for them.
pub struct WebhookNotifier {
    endpoint: Url,
    client: Client,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            client: Client::new(),
            in_flight: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn flush(&self) {
        let handles = match self.in_flight.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(%error, "refresh request task failed");
            }
        }
    }
}

impl IndexNotifier for WebhookNotifier {
    fn request_refresh(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(endpoint = %self.endpoint, "no async runtime, index refresh not sent");
            return;
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let handle = runtime.spawn(async move {
            let request = client.post(endpoint.clone()).json(&json!({
                "event": "refresh_index",
                "requested_at": Utc::now().to_rfc3339(),
            }));
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(endpoint = %endpoint, "index refresh requested");
                }
                Ok(response) => {
                    warn!(endpoint = %endpoint, status = %response.status(), "index refresh rejected");
                }
                Err(error) => {
                    warn!(endpoint = %endpoint, %error, "index refresh request failed");
                }
            }
        });

        match self.in_flight.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}
