//! Remote gist storage.
//!
//! The remote store is a revisioned set of named text files reachable by
//! one identifier. [`RemoteStorage`] is the seam the orchestrator depends
//! on; [`GistClient`] implements it over the gist HTTP API with bearer
//! token auth and an optional proxy.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

use crate::errors::{SyncError, SyncResult};
use crate::setting::EXTENSIONS_FILE;

/// Description sentinel identifying collections created by this engine.
pub const COLLECTION_DESCRIPTION: &str = "Editor Settings Sync";

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("edsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub filename: String,
    pub content: String,
}

/// One revision of the remote collection.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub id: String,
    pub description: String,
    pub files: BTreeMap<String, RemoteFile>,
    /// Server-assigned revision timestamp.
    pub updated_at: DateTime<Utc>,
}

impl RemoteSnapshot {
    pub fn file_content(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(|f| f.content.as_str())
    }
}

/// Write batch: `None` content deletes that file remotely.
pub type FileChanges = BTreeMap<String, Option<String>>;

#[allow(async_fn_in_trait)]
pub trait RemoteStorage {
    async fn get(&self, id: &str) -> SyncResult<RemoteSnapshot>;
    async fn create(
        &self,
        files: FileChanges,
        description: &str,
        public: bool,
    ) -> SyncResult<RemoteSnapshot>;
    async fn update(&self, id: &str, files: FileChanges) -> SyncResult<RemoteSnapshot>;
    /// All collections of the authenticated principal that look like ours:
    /// description matches the sentinel or the file set carries an
    /// `extensions.json` entry. Ascending by revision timestamp.
    async fn list_all(&self) -> SyncResult<Vec<RemoteSnapshot>>;
    async fn delete(&self, id: &str) -> SyncResult<()>;
}

#[derive(Debug, Deserialize)]
struct GistFileWire {
    filename: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistWire {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, GistFileWire>,
    updated_at: DateTime<Utc>,
}

impl From<GistWire> for RemoteSnapshot {
    fn from(wire: GistWire) -> Self {
        let files = wire
            .files
            .into_iter()
            .map(|(name, f)| {
                (
                    name,
                    RemoteFile {
                        filename: f.filename,
                        content: f.content.unwrap_or_default(),
                    },
                )
            })
            .collect();
        RemoteSnapshot {
            id: wire.id,
            description: wire.description.unwrap_or_default(),
            files,
            updated_at: wire.updated_at,
        }
    }
}

pub struct GistClient {
    http: reqwest::Client,
    token: Option<String>,
    base: String,
}

impl GistClient {
    pub fn new(token: Option<String>, proxy_url: Option<&str>) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(proxy) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| SyncError::Network(format!("bad proxy url: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self {
            http,
            token,
            base: API_BASE.to_string(),
        })
    }

    /// Point the client at a different API root; used by tests.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.header("Accept", "application/vnd.github+json")
    }

    fn files_body(files: FileChanges) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, content) in files {
            let entry = match content {
                Some(content) => json!({ "content": content }),
                None => serde_json::Value::Null,
            };
            map.insert(name, entry);
        }
        serde_json::Value::Object(map)
    }

    async fn parse_snapshot(resp: reqwest::Response, what: &str) -> SyncResult<RemoteSnapshot> {
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status, what));
        }
        let wire: GistWire = resp
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("malformed response: {}", e)))?;
        Ok(wire.into())
    }
}

impl RemoteStorage for GistClient {
    async fn get(&self, id: &str) -> SyncResult<RemoteSnapshot> {
        debug!(id, "fetching remote collection");
        let resp = self
            .request(reqwest::Method::GET, &format!("/gists/{}", id))
            .send()
            .await?;
        Self::parse_snapshot(resp, id).await
    }

    async fn create(
        &self,
        files: FileChanges,
        description: &str,
        public: bool,
    ) -> SyncResult<RemoteSnapshot> {
        let body = json!({
            "description": description,
            "public": public,
            "files": Self::files_body(files),
        });
        let resp = self
            .request(reqwest::Method::POST, "/gists")
            .json(&body)
            .send()
            .await?;
        Self::parse_snapshot(resp, "new collection").await
    }

    async fn update(&self, id: &str, files: FileChanges) -> SyncResult<RemoteSnapshot> {
        debug!(id, files = files.len(), "updating remote collection");
        let body = json!({ "files": Self::files_body(files) });
        let resp = self
            .request(reqwest::Method::PATCH, &format!("/gists/{}", id))
            .json(&body)
            .send()
            .await?;
        Self::parse_snapshot(resp, id).await
    }

    async fn list_all(&self) -> SyncResult<Vec<RemoteSnapshot>> {
        let resp = self
            .request(reqwest::Method::GET, "/gists?per_page=100")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status, "collection list"));
        }
        let wires: Vec<GistWire> = resp
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("malformed response: {}", e)))?;
        let mut snapshots: Vec<RemoteSnapshot> = wires
            .into_iter()
            .map(RemoteSnapshot::from)
            .filter(|s| {
                s.description == COLLECTION_DESCRIPTION || s.files.contains_key(EXTENSIONS_FILE)
            })
            .collect();
        snapshots.sort_by_key(|s| s.updated_at);
        Ok(snapshots)
    }

    async fn delete(&self, id: &str) -> SyncResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/gists/{}", id))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status, id));
        }
        Ok(())
    }
}
