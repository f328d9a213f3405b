//! Instance Client
//!
//! HTTP access to one database instance. Bodies are passed as `Bytes`
//! end to end; nothing here decodes a replayed payload.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::InstancesConfig;
use crate::error::{Error, Result};
use crate::wal::Instance;

/// Collection as reported by an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, alias = "configuration_json")]
    pub configuration: Option<serde_json::Value>,
}

impl CollectionInfo {
    /// Creation parameters worth mirroring to the other instance
    pub fn creation_config(&self) -> serde_json::Value {
        serde_json::json!({
            "metadata": self.metadata,
            "configuration": self.configuration,
        })
    }
}

/// Status and body of a forwarded request
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text for error messages, truncated
    pub fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(300).collect()
    }
}

/// Client for one instance
pub struct InstanceClient {
    instance: Instance,
    base_url: String,
    collections_path: String,
    http: reqwest::Client,
}

impl InstanceClient {
    pub fn new(instance: Instance, config: &InstancesConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            instance,
            base_url: config.url(instance).to_string(),
            collections_path: format!(
                "/api/v2/tenants/{}/databases/{}/collections",
                config.tenant, config.database
            ),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.instance)
        } else {
            Error::Http(e)
        }
    }

    /// Liveness check
    pub async fn heartbeat(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/api/v2/heartbeat"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::InstanceStatus {
                instance: self.instance,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    /// Look a collection up by name; None when the instance does not know it.
    ///
    /// The instance routes `GET .../collections/{x}` by name, so ids go
    /// through [`InstanceClient::collection_by_id`].
    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let path = format!("{}/{}", self.collections_path, name);
        let response = self.send(reqwest::Method::GET, &path, &BTreeMap::new(), Bytes::new()).await?;

        if response.is_success() {
            return serde_json::from_slice(&response.body)
                .map(Some)
                .map_err(|e| Error::InvalidResponse {
                    instance: self.instance,
                    reason: format!("collection {}: {}", name, e),
                });
        }
        if is_not_found(response.status, &response.body) {
            return Ok(None);
        }
        Err(Error::InstanceStatus {
            instance: self.instance,
            status: response.status,
            body: response.body_excerpt(),
        })
    }

    /// List collections
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let response = self
            .send(reqwest::Method::GET, &self.collections_path, &BTreeMap::new(), Bytes::new())
            .await?;
        if !response.is_success() {
            return Err(Error::InstanceStatus {
                instance: self.instance,
                status: response.status,
                body: response.body_excerpt(),
            });
        }
        serde_json::from_slice(&response.body).map_err(|e| Error::InvalidResponse {
            instance: self.instance,
            reason: format!("collection list: {}", e),
        })
    }

    /// Look a collection up by the id this instance assigned it
    pub async fn collection_by_id(&self, id: &str) -> Result<Option<CollectionInfo>> {
        let collections = self.list_collections().await?;
        Ok(collections.into_iter().find(|c| c.id == id))
    }

    /// Create a collection (or return the existing one with that name)
    pub async fn create_collection(
        &self,
        name: &str,
        metadata: Option<&serde_json::Value>,
        configuration: Option<&serde_json::Value>,
    ) -> Result<CollectionInfo> {
        let body = serde_json::json!({
            "name": name,
            "metadata": metadata,
            "configuration": configuration,
            "get_or_create": true,
        });
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        let response = self
            .send(
                reqwest::Method::POST,
                &self.collections_path,
                &headers,
                Bytes::from(serde_json::to_vec(&body)?),
            )
            .await?;

        if !response.is_success() {
            return Err(Error::InstanceStatus {
                instance: self.instance,
                status: response.status,
                body: response.body_excerpt(),
            });
        }

        let created: CollectionInfo =
            serde_json::from_slice(&response.body).map_err(|e| Error::InvalidResponse {
                instance: self.instance,
                reason: format!("created collection {}: {}", name, e),
            })?;
        tracing::info!("Created collection {} on {} as {}", name, self.instance, created.id);
        Ok(created)
    }

    /// Send a request as-is.
    ///
    /// Non-2xx responses are returned, not raised; only transport
    /// failures and timeouts are errors.
    pub async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<RawResponse> {
        let mut request = self.http.request(method, self.url(path));
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Instances answer unknown collections with 404, or with a 400/500
/// whose message says the collection does not exist.
pub fn is_not_found(status: u16, body: &[u8]) -> bool {
    if status == 404 {
        return true;
    }
    if status == 400 || status == 500 {
        let text = String::from_utf8_lossy(body).to_lowercase();
        return text.contains("does not exist") || text.contains("not found");
    }
    false
}

/// Both instance clients
pub struct Instances {
    primary: InstanceClient,
    replica: InstanceClient,
}

impl Instances {
    pub fn new(config: &InstancesConfig) -> Result<Self> {
        Ok(Self {
            primary: InstanceClient::new(Instance::Primary, config)?,
            replica: InstanceClient::new(Instance::Replica, config)?,
        })
    }

    pub fn get(&self, instance: Instance) -> &InstanceClient {
        match instance {
            Instance::Primary => &self.primary,
            Instance::Replica => &self.replica,
        }
    }
}
