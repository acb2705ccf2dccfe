use crate::error::TransportError;
use crate::signaling::bus::{MessageBus, StoredSignal};
use crate::signaling::message::SignalKey;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Signaling store reached over HTTP.
///
/// Layout under the base URL:
/// `PUT|DELETE sessions/{id}/signals/{key}` for single entries,
/// `GET sessions/{id}/signals` for the sorted list and
/// `DELETE sessions/{id}/signals?before=ms|retain=key` for purges.
pub struct HttpBus {
    base: Url,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    #[serde(default)]
    removed: usize,
}

impl HttpBus {
    pub fn new(base: &str) -> Result<Self, TransportError> {
        let base = Url::parse(base)
            .map_err(|err| TransportError::InvalidUrl(format!("{base}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(format!(
                "{base} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { base, client })
    }

    fn signals_url(&self, session_id: &str, key: Option<&SignalKey>) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidUrl("cannot mutate signaling url path".into()))?;
            segments.pop_if_empty();
            segments.push("sessions");
            segments.push(session_id);
            segments.push("signals");
            if let Some(key) = key {
                segments.push(&key.to_string());
            }
        }
        Ok(url)
    }

    async fn purge(&self, url: Url) -> Result<usize, TransportError> {
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let payload = response.json::<PurgeResponse>().await?;
        Ok(payload.removed)
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn append(
        &self,
        session_id: &str,
        key: SignalKey,
        data: String,
    ) -> Result<(), TransportError> {
        let url = self.signals_url(session_id, Some(&key))?;
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<StoredSignal>, TransportError> {
        let url = self.signals_url(session_id, None)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let mut entries = response.json::<Vec<StoredSignal>>().await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(session_id, count = entries.len(), "listed stored signals");
        Ok(entries)
    }

    async fn remove(&self, session_id: &str, key: &SignalKey) -> Result<(), TransportError> {
        let url = self.signals_url(session_id, Some(key))?;
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn purge_older_than(
        &self,
        session_id: &str,
        cutoff_ms: i64,
    ) -> Result<usize, TransportError> {
        let mut url = self.signals_url(session_id, None)?;
        url.query_pairs_mut()
            .append_pair("before", &cutoff_ms.to_string());
        self.purge(url).await
    }

    async fn purge_session(
        &self,
        session_id: &str,
        retain: Option<&SignalKey>,
    ) -> Result<usize, TransportError> {
        let mut url = self.signals_url(session_id, None)?;
        if let Some(key) = retain {
            url.query_pairs_mut().append_pair("retain", &key.to_string());
        }
        self.purge(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_signal_urls_under_base_path() {
        let bus = HttpBus::new("https://signal.example.org/api/").expect("bus");
        let key = SignalKey {
            time: 42,
            message_id: "beef".into(),
        };
        assert_eq!(
            bus.signals_url("482913", None).expect("url").as_str(),
            "https://signal.example.org/api/sessions/482913/signals"
        );
        assert_eq!(
            bus.signals_url("482913", Some(&key)).expect("url").as_str(),
            "https://signal.example.org/api/sessions/482913/signals/0000000000042_beef"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(matches!(
            HttpBus::new("mailto:someone@example.org"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpBus::new("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
