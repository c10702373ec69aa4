//! Services the session layer depends on but does not own: bundle URL
//! resolution for dependencies and product analytics.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "web" => Ok(Platform::Web),
            other => Err(format!("unknown platform `{other}`")),
        }
    }
}

/// A dependency as declared by the editor: package name and version range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unable to resolve {package}: {reason}")]
pub struct UnresolvedError {
    pub package: String,
    pub reason: String,
}

impl UnresolvedError {
    pub fn new(package: &PackageSpec, reason: impl Into<String>) -> Self {
        Self {
            package: format!("{}@{}", package.name, package.version),
            reason: reason.into(),
        }
    }
}

/// Maps a package to the URL of a bundle built for one runtime version.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve_module_url(
        &self,
        package: &PackageSpec,
        target_version: &str,
        platform: Option<Platform>,
    ) -> Result<Url, UnresolvedError>;
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ResolveFailure {
    error: String,
}

/// Resolver backed by the bundler's `GET /resolve` endpoint.
#[derive(Debug, Clone)]
pub struct HttpModuleResolver {
    client: Client,
    base_url: Url,
}

impl HttpModuleResolver {
    pub fn new(base_url: &str) -> Result<Self, url::ParseError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl ModuleResolver for HttpModuleResolver {
    async fn resolve_module_url(
        &self,
        package: &PackageSpec,
        target_version: &str,
        platform: Option<Platform>,
    ) -> Result<Url, UnresolvedError> {
        let mut endpoint = self
            .base_url
            .join("resolve")
            .map_err(|err| UnresolvedError::new(package, err.to_string()))?;
        {
            let mut query = endpoint.query_pairs_mut();
            query
                .append_pair("name", &package.name)
                .append_pair("version", &package.version)
                .append_pair("sdkVersion", target_version);
            if let Some(platform) = platform {
                query.append_pair("platform", platform.as_str());
            }
        }

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|err| UnresolvedError::new(package, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ResolveFailure>().await {
                Ok(failure) => failure.error,
                Err(_) => format!("bundler responded with {status}"),
            };
            return Err(UnresolvedError::new(package, reason));
        }
        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|err| UnresolvedError::new(package, err.to_string()))?;
        Url::parse(&body.url).map_err(|err| UnresolvedError::new(package, err.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("analytics sink failed: {0}")]
pub struct AnalyticsError(pub String);

/// Product analytics. Failures are the caller's to log; they never abort
/// session work.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &str, properties: &Map<String, Value>) -> Result<(), AnalyticsError>;
}

/// Default sink: writes analytics events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn record(&self, event: &str, properties: &Map<String, Value>) -> Result<(), AnalyticsError> {
        tracing::info!(
            target = "snack::analytics",
            event,
            properties = %serde_json::Value::Object(properties.clone()),
            "analytics event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn resolve(Query(params): Query<HashMap<String, String>>) -> (StatusCode, Json<Value>) {
        match params.get("name").map(String::as_str) {
            Some("missing-package") => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "package not found"})),
            ),
            Some(name) => {
                let platform = params.get("platform").cloned().unwrap_or_else(|| "any".into());
                let sdk = params.get("sdkVersion").cloned().unwrap_or_default();
                let version = params.get("version").cloned().unwrap_or_default();
                (
                    StatusCode::OK,
                    Json(json!({
                        "url": format!("https://cdn.example/{sdk}/{platform}/{name}@{version}.js")
                    })),
                )
            }
            None => (StatusCode::BAD_REQUEST, Json(json!({"error": "name required"}))),
        }
    }

    async fn bundler() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let router = Router::new().route("/v2/resolve", get(resolve));
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}/v2")
    }

    #[tokio::test]
    async fn resolves_bundle_urls_per_version_and_platform() {
        let resolver = HttpModuleResolver::new(&bundler().await).expect("resolver");
        let url = resolver
            .resolve_module_url(
                &PackageSpec::new("lodash", "4.17.21"),
                "40.0.0",
                Some(Platform::Android),
            )
            .await
            .expect("resolved");
        assert_eq!(
            url.as_str(),
            "https://cdn.example/40.0.0/android/lodash@4.17.21.js"
        );
    }

    #[tokio::test]
    async fn bundler_errors_become_unresolved() {
        let resolver = HttpModuleResolver::new(&bundler().await).expect("resolver");
        let err = resolver
            .resolve_module_url(&PackageSpec::new("missing-package", "1.0.0"), "40.0.0", None)
            .await
            .expect_err("unresolved");
        assert_eq!(err.package, "missing-package@1.0.0");
        assert_eq!(err.reason, "package not found");
    }

    #[tokio::test]
    async fn unreachable_bundler_is_unresolved_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        let resolver = HttpModuleResolver::new(&format!("http://{addr}")).expect("resolver");
        let err = resolver
            .resolve_module_url(&PackageSpec::new("react", "18.2.0"), "40.0.0", None)
            .await
            .expect_err("connection refused");
        assert_eq!(err.package, "react@18.2.0");
    }

    #[test]
    fn platform_parsing() {
        assert_eq!("iOS".parse::<Platform>(), Ok(Platform::Ios));
        assert!("tvos".parse::<Platform>().is_err());
    }
}
