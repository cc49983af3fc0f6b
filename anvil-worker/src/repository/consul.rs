//! Consul-compatible coordination store
//!
//! Talks to the `/v1/kv` HTTP API. Values are read with `?raw` and prefix
//! listings with `?keys`, so no payload decoding is needed.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::{CoordinationStore, StoreError};

/// HTTP implementation of CoordinationStore
pub struct ConsulStore {
    client: Client,
    base_url: String,
}

impl ConsulStore {
    /// Creates a new Consul store
    ///
    /// # Arguments
    /// * `base_url` - Agent URL (e.g., "http://localhost:8500")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Coordination { status, message })
}

#[async_trait]
impl CoordinationStore for ConsulStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.kv_url(key))
            .body(value.to_vec())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let response = self
            .client
            .get(self.kv_url(key))
            .query(&[("raw", "")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let bytes = check(response).await?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let response = self
            .client
            .get(self.kv_url(prefix))
            .query(&[("keys", "")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let mut keys: Vec<String> = check(response).await?.json().await?;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can vanish between listing and reading
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self.client.delete(self.kv_url(key)).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.kv_url(prefix))
            .query(&[("recurse", "")])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_url_normalizes_slashes() {
        let store = ConsulStore::new("http://consul:8500/");
        assert_eq!(
            store.kv_url("/anvil/build_map/abc"),
            "http://consul:8500/v1/kv/anvil/build_map/abc"
        );
    }
}
