//! Remote extension metadata.
//!
//! Used by the auto-update step to bump a desired extension to the newest
//! version whose engine requirement is satisfied by the running host.

use semver::{Version, VersionReq};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::errors::{SyncError, SyncResult};
use crate::extensions::Extension;

/// One published version of an extension. `engine` is a semver requirement
/// such as `^1.80.0`.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: String,
    pub engine: String,
    pub download_url: Option<String>,
}

/// Published metadata for one extension; `versions` is ordered newest
/// first, as the marketplace returns it.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMetadata {
    pub versions: Vec<VersionInfo>,
}

#[allow(async_fn_in_trait)]
pub trait MetadataProvider {
    /// Query metadata for the given ids. The returned map is keyed by
    /// lowercased id; ids the marketplace does not know are absent.
    async fn query(&self, ids: &[String]) -> SyncResult<HashMap<String, ExtensionMetadata>>;
}

/// First (newest) version whose engine requirement matches the host
/// version. `None` when nothing satisfies, in which case the caller keeps
/// the declared version untouched.
pub fn latest_compatible<'a>(
    meta: &'a ExtensionMetadata,
    host_version: &str,
) -> Option<&'a VersionInfo> {
    let host = Version::parse(host_version).ok()?;
    meta.versions.iter().find(|info| {
        VersionReq::parse(&info.engine)
            .map(|req| req.matches(&host))
            .unwrap_or(false)
    })
}

/// Apply auto-update: bump each desired extension to its latest compatible
/// published version, leaving entries without a satisfying version alone.
pub async fn auto_update_versions<M: MetadataProvider>(
    desired: &mut [Extension],
    host_version: &str,
    provider: &M,
) -> SyncResult<()> {
    let ids: Vec<String> = desired.iter().map(|e| e.key()).collect();
    if ids.is_empty() {
        return Ok(());
    }
    let metadata = provider.query(&ids).await?;
    for ext in desired.iter_mut() {
        if let Some(meta) = metadata.get(&ext.key()) {
            if let Some(info) = latest_compatible(meta, host_version) {
                if info.version != ext.version {
                    debug!(id = %ext.id, from = %ext.version, to = %info.version, "auto-update");
                    ext.version = info.version.clone();
                }
                if ext.download_url.is_none() {
                    ext.download_url = info.download_url.clone();
                }
            }
        }
    }
    Ok(())
}

const MARKETPLACE_QUERY_URL: &str =
    "https://marketplace.visualstudio.com/_apis/public/gallery/extensionquery";
const ENGINE_PROPERTY: &str = "Microsoft.VisualStudio.Code.Engine";
const PACKAGE_ASSET: &str = "Microsoft.VisualStudio.Services.VSIXPackage";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    extensions: Vec<WireExtension>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExtension {
    extension_name: String,
    publisher: WirePublisher,
    versions: Vec<WireVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePublisher {
    publisher_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVersion {
    version: String,
    #[serde(default)]
    asset_uri: Option<String>,
    #[serde(default)]
    properties: Vec<WireProperty>,
}

#[derive(Debug, Deserialize)]
struct WireProperty {
    key: String,
    value: String,
}

/// Marketplace-backed metadata provider.
pub struct MarketplaceClient {
    http: reqwest::Client,
    url: String,
}

impl MarketplaceClient {
    pub fn new(proxy_url: Option<&str>) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("edsync/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| SyncError::Network(format!("bad proxy url: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            http: builder
                .build()
                .map_err(|e| SyncError::Network(e.to_string()))?,
            url: MARKETPLACE_QUERY_URL.to_string(),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl MetadataProvider for MarketplaceClient {
    async fn query(&self, ids: &[String]) -> SyncResult<HashMap<String, ExtensionMetadata>> {
        // filterType 7 = extension name (publisher.name); flags request
        // version lists with properties and asset URIs.
        let criteria: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| json!({ "filterType": 7, "value": id }))
            .collect();
        let body = json!({
            "filters": [{ "criteria": criteria, "pageNumber": 1, "pageSize": ids.len() }],
            "flags": 0x1 | 0x10 | 0x80,
        });
        let resp = self
            .http
            .post(&self.url)
            .header("Accept", "application/json;api-version=3.0-preview.1")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status, "extension metadata"));
        }
        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("malformed metadata response: {}", e)))?;

        let mut out = HashMap::new();
        for wire in parsed.results.into_iter().flat_map(|r| r.extensions) {
            let id = format!(
                "{}.{}",
                wire.publisher.publisher_name, wire.extension_name
            )
            .to_lowercase();
            let versions = wire
                .versions
                .into_iter()
                .map(|v| {
                    let engine = v
                        .properties
                        .iter()
                        .find(|p| p.key == ENGINE_PROPERTY)
                        .map(|p| p.value.clone())
                        .unwrap_or_else(|| "*".to_string());
                    VersionInfo {
                        download_url: v.asset_uri.map(|uri| format!("{}/{}", uri, PACKAGE_ASSET)),
                        version: v.version,
                        engine,
                    }
                })
                .collect();
            out.insert(id, ExtensionMetadata { versions });
        }
        Ok(out)
    }
}
