// Copyright 2025 jsvault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Client for the `/__tasks` admin endpoints.

use anyhow::{anyhow, Context, Result};
use jsvault_common::RegistrySnapshot;
use reqwest::{StatusCode, Url};

pub struct AdminClient {
    base: Url,
    http: reqwest::Client,
}

impl AdminClient {
    /// `base` must be an `http://` or `https://` URL of a jsvault server.
    pub fn new(base: &str) -> Result<Self> {
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(anyhow!("Invalid server address: '{}' must start with http:// or https://", base));
        }
        let base = Url::parse(base).with_context(|| format!("Invalid server address '{}'", base))?;
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    /// `/__tasks`, or `/__tasks/<id>` with `id` encoded as one segment.
    pub fn tasks_url(&self, id: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("'{}' cannot be used as a base URL", self.base))?;
            segments.pop_if_empty().push("__tasks");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let response = self.http.get(self.tasks_url(None)?).send().await?;
        Self::parse(response).await
    }

    /// Force-stop `id` and return the registry as it is afterwards.
    pub async fn stop_task(&self, id: &str) -> Result<RegistrySnapshot> {
        let response = self.http.delete(self.tasks_url(Some(id))?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(anyhow!("Task not found: {}", id));
        }
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<RegistrySnapshot> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Server returned {}: {}", status, body));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_url_without_scheme() {
        assert!(AdminClient::new("127.0.0.1:8080").is_err());
        assert!(AdminClient::new("http://127.0.0.1:8080").is_ok());
    }

    #[test]
    fn test_task_id_is_one_path_segment() {
        let client = AdminClient::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(client.tasks_url(None).unwrap().as_str(), "http://127.0.0.1:8080/__tasks");
        assert_eq!(
            client.tasks_url(Some("(abc)/jobs/run.js")).unwrap().as_str(),
            "http://127.0.0.1:8080/__tasks/(abc)%2Fjobs%2Frun.js"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let client = AdminClient::new("http://example.com/vault/").unwrap();
        assert_eq!(client.tasks_url(None).unwrap().as_str(), "http://example.com/vault/__tasks");
    }
}
