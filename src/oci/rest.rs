//! REST implementation of [`OciApi`] with signed requests.

use chrono::Utc;
use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::api::{
    ApiFuture, CreateImageDetails, ImageResource, InstanceResource, LaunchInstanceDetails, OciApi,
    Vnic, VnicAttachment,
};
use super::signer::{OciProfile, RequestSigner, SignerError, SigningInput};
use crate::http::{ApiError, HTTP_CLIENT, check, decode};

const API_VERSION: &str = "20160918";

/// Builds the URL for `resource`, form-encoding `query`.
fn resource_url(host: &str, resource: &str, query: &[(&str, &str)]) -> Result<Url, ApiError> {
    let mut url = Url::parse(&format!("https://{host}/{API_VERSION}/{resource}"))
        .map_err(|err| ApiError::Transport(format!("invalid url for {resource}: {err}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// Path and query exactly as they go on the wire; the signature covers this.
fn path_and_query(url: &Url) -> String {
    url.query().map_or_else(
        || url.path().to_owned(),
        |query| format!("{}?{query}", url.path()),
    )
}

/// Core-services REST client for one region.
#[derive(Debug)]
pub struct RestOciApi {
    host: String,
    signer: RequestSigner,
}

impl RestOciApi {
    /// Creates a client for `region` signing with `signer`.
    #[must_use]
    pub fn new(region: &str, signer: RequestSigner) -> Self {
        Self {
            host: format!("iaas.{region}.oraclecloud.com"),
            signer,
        }
    }

    /// Creates a client from a configuration-file profile.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] when the profile's key cannot be loaded.
    pub fn from_profile(profile: &OciProfile) -> Result<Self, SignerError> {
        Ok(Self::new(
            &profile.region,
            RequestSigner::from_profile(profile)?,
        ))
    }

    /// Sends a signed request for `resource` with `query` appended.
    async fn request(
        &self,
        method: Method,
        resource: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = resource_url(&self.host, resource, query)?;
        let path = path_and_query(&url);
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let headers = self
            .signer
            .sign(&SigningInput {
                method: method.as_str(),
                host: &self.host,
                path_and_query: &path,
                date: &date,
                body: body.as_deref(),
            })
            .map_err(|err| ApiError::Auth(err.to_string()))?;

        debug!(%method, path = %path, "oci request");
        let mut request = HTTP_CLIENT.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(bytes) = body {
            request = request.body(bytes);
        }
        let response = request.send().await?;
        check(response, resource).await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        resource: String,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let response = self.request(Method::GET, &resource, query, None).await?;
        decode(response, &resource).await
    }

    async fn post<T, B>(
        &self,
        resource: String,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync,
    {
        let bytes = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|err| ApiError::Decode {
                resource: resource.clone(),
                message: err.to_string(),
            })?
            .unwrap_or_default();
        let response = self.request(Method::POST, &resource, query, Some(bytes)).await?;
        decode(response, &resource).await
    }
}

impl OciApi for RestOciApi {
    fn launch_instance<'a>(
        &'a self,
        details: &'a LaunchInstanceDetails,
    ) -> ApiFuture<'a, InstanceResource> {
        Box::pin(self.post(String::from("instances"), &[], Some(details)))
    }

    fn get_instance<'a>(&'a self, instance_id: &'a str) -> ApiFuture<'a, InstanceResource> {
        Box::pin(self.fetch(format!("instances/{instance_id}"), &[]))
    }

    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.request(Method::DELETE, &format!("instances/{instance_id}"), &[], None)
                .await
                .map(drop)
        })
    }

    fn instance_action<'a>(
        &'a self,
        instance_id: &'a str,
        action: &'a str,
    ) -> ApiFuture<'a, InstanceResource> {
        Box::pin(async move {
            self.post(
                format!("instances/{instance_id}"),
                &[("action", action)],
                None::<&()>,
            )
            .await
        })
    }

    fn list_vnic_attachments<'a>(
        &'a self,
        compartment_id: &'a str,
        instance_id: &'a str,
    ) -> ApiFuture<'a, Vec<VnicAttachment>> {
        Box::pin(async move {
            self.fetch(
                String::from("vnicAttachments"),
                &[("compartmentId", compartment_id), ("instanceId", instance_id)],
            )
            .await
        })
    }

    fn get_vnic<'a>(&'a self, vnic_id: &'a str) -> ApiFuture<'a, Vnic> {
        Box::pin(self.fetch(format!("vnics/{vnic_id}"), &[]))
    }

    fn create_image<'a>(
        &'a self,
        details: &'a CreateImageDetails,
    ) -> ApiFuture<'a, ImageResource> {
        Box::pin(self.post(String::from("images"), &[], Some(details)))
    }

    fn get_image<'a>(&'a self, image_id: &'a str) -> ApiFuture<'a, ImageResource> {
        Box::pin(self.fetch(format!("images/{image_id}"), &[]))
    }

    fn latest_image<'a>(
        &'a self,
        compartment_id: &'a str,
        operating_system: &'a str,
    ) -> ApiFuture<'a, Option<ImageResource>> {
        Box::pin(async move {
            let images: Vec<ImageResource> = self
                .fetch(
                    String::from("images"),
                    &[
                        ("compartmentId", compartment_id),
                        ("operatingSystem", operating_system),
                        ("sortBy", "TIMECREATED"),
                        ("sortOrder", "DESC"),
                        ("limit", "1"),
                    ],
                )
                .await?;
            Ok(images.into_iter().next())
        })
    }
}
