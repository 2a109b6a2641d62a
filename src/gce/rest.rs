//! REST implementation of [`GceApi`] and the metadata-server client.

use std::env;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::api::{ApiFuture, GceApi, ImageResource, InstanceResource, Operation};
use crate::http::{ApiError, HTTP_CLIENT, check, decode};

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Environment variable holding a pre-minted OAuth access token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Client for the Compute Engine metadata server.
#[derive(Clone, Debug)]
pub struct MetadataServer {
    base: String,
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
    expires_in: u64,
}

impl MetadataServer {
    /// Targets the well-known metadata endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base(METADATA_BASE)
    }

    /// Targets a custom endpoint.
    #[must_use]
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    async fn fetch(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        let response = HTTP_CLIENT
            .get(format!("{}/{path}", self.base))
            .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
            .send()
            .await?;
        check(response, path).await
    }

    /// Returns the project hosting the current machine.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the metadata server is unreachable.
    pub async fn project_id(&self) -> Result<String, ApiError> {
        let text = self.fetch("project/project-id").await?.text().await?;
        Ok(text.trim().to_owned())
    }

    /// Returns the zone hosting the current machine.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the metadata server is unreachable.
    pub async fn zone(&self) -> Result<String, ApiError> {
        let text = self.fetch("instance/zone").await?.text().await?;
        Ok(zone_name(&text))
    }

    async fn access_token(&self) -> Result<AccessToken, ApiError> {
        let path = "instance/service-accounts/default/token";
        let body = self.fetch(path).await?.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| ApiError::Decode {
            resource: path.to_owned(),
            message: err.to_string(),
        })
    }
}

impl Default for MetadataServer {
    fn default() -> Self {
        Self::new()
    }
}

/// The metadata server reports zones as `projects/<number>/zones/<zone>`.
fn zone_name(raw: &str) -> String {
    raw.trim()
        .rsplit('/')
        .next()
        .map(str::to_owned)
        .unwrap_or_default()
}

/// Where bearer tokens come from.
#[derive(Clone, Debug)]
pub enum TokenSource {
    /// A fixed token, typically from [`ACCESS_TOKEN_ENV`].
    Static(String),
    /// The metadata server's default service account.
    Metadata(MetadataServer),
}

impl TokenSource {
    /// Picks a static token when `value` is non-empty, otherwise the metadata
    /// server.
    #[must_use]
    pub fn from_value(value: Option<String>) -> Self {
        match value {
            Some(token) if !token.trim().is_empty() => Self::Static(token.trim().to_owned()),
            _ => Self::Metadata(MetadataServer::new()),
        }
    }

    /// Reads [`ACCESS_TOKEN_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_value(env::var(ACCESS_TOKEN_ENV).ok())
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Compute Engine v1 REST client.
pub struct RestGceApi {
    base: String,
    source: TokenSource,
    cache: Mutex<Option<CachedToken>>,
}

impl RestGceApi {
    /// Creates a client authenticating with `source`.
    #[must_use]
    pub fn new(source: TokenSource) -> Self {
        Self {
            base: String::from(COMPUTE_BASE),
            source,
            cache: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String, ApiError> {
        let server = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata(server) => server,
        };
        let mut cached = self.cache.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| Instant::now() < token.expires_at) {
            return Ok(token.value.clone());
        }
        let fresh = server
            .access_token()
            .await
            .map_err(|err| ApiError::Auth(err.to_string()))?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }

    async fn send<T, B>(&self, method: Method, path: String, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let token = self.token().await?;
        let url = format!("{}/{path}", self.base);
        debug!(%method, url = %url, "compute request");
        let mut request = HTTP_CLIENT.request(method, &url).bearer_auth(token);
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        decode(response, &path).await
    }
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

impl GceApi for RestGceApi {
    fn insert_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        instance: &'a InstanceResource,
    ) -> ApiFuture<'a, Operation> {
        let path = format!(
            "projects/{project}/zones/{zone}/instances?requestId={}",
            request_id()
        );
        Box::pin(self.send(Method::POST, path, Some(instance)))
    }

    fn get_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, InstanceResource> {
        let path = format!("projects/{project}/zones/{zone}/instances/{name}");
        Box::pin(self.send(Method::GET, path, None::<&()>))
    }

    fn delete_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Operation> {
        let path = format!(
            "projects/{project}/zones/{zone}/instances/{name}?requestId={}",
            request_id()
        );
        Box::pin(self.send(Method::DELETE, path, None::<&()>))
    }

    fn stop_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Operation> {
        let path = format!(
            "projects/{project}/zones/{zone}/instances/{name}/stop?requestId={}",
            request_id()
        );
        Box::pin(self.send(Method::POST, path, None::<&()>))
    }

    fn get_zone_operation<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        operation: &'a str,
    ) -> ApiFuture<'a, Operation> {
        let path = format!("projects/{project}/zones/{zone}/operations/{operation}");
        Box::pin(self.send(Method::GET, path, None::<&()>))
    }

    fn insert_image<'a>(
        &'a self,
        project: &'a str,
        image: &'a ImageResource,
    ) -> ApiFuture<'a, Operation> {
        let path = format!("projects/{project}/global/images?requestId={}", request_id());
        Box::pin(self.send(Method::POST, path, Some(image)))
    }

    fn get_global_operation<'a>(
        &'a self,
        project: &'a str,
        operation: &'a str,
    ) -> ApiFuture<'a, Operation> {
        let path = format!("projects/{project}/global/operations/{operation}");
        Box::pin(self.send(Method::GET, path, None::<&()>))
    }

    fn get_image<'a>(&'a self, project: &'a str, name: &'a str) -> ApiFuture<'a, ImageResource> {
        let path = format!("projects/{project}/global/images/{name}");
        Box::pin(self.send(Method::GET, path, None::<&()>))
    }
}
