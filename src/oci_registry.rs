use crate::credentials::{CredentialSource, RegistryCredential};
use crate::error::{ResolutionError, ResolutionFailure};
use crate::image_reference::{ImageReference, is_valid_digest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Certificate, Client, RequestBuilder};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static DIGEST_HEADER: &str = "Docker-Content-Digest";
static MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Resolves the digest a registry currently serves for an image tag.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve_digest(&self, image: &ImageReference) -> Result<String, ResolutionError>;
}

pub fn create_client(ca_certificate_paths: &[PathBuf], timeout: Duration) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));

    for file_path in ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

pub struct OciRegistryResolver {
    client: Client,
    credentials: Arc<dyn CredentialSource>,
    insecure_registries: HashSet<String>,
    enable_jfrog_artifactory_fallback: bool,
}

impl OciRegistryResolver {
    pub fn new(
        client: Client,
        credentials: Arc<dyn CredentialSource>,
        insecure_registries: impl IntoIterator<Item = String>,
        enable_jfrog_artifactory_fallback: bool,
    ) -> Self {
        Self {
            client,
            credentials,
            insecure_registries: insecure_registries
                .into_iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            enable_jfrog_artifactory_fallback,
        }
    }

    fn base_url(&self, image: &ImageReference) -> String {
        let host = image.api_host();
        let scheme = if self.insecure_registries.contains(&host.to_ascii_lowercase())
            || self.insecure_registries.contains(&image.registry.to_ascii_lowercase())
        {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    fn authorize(&self, request: RequestBuilder, image: &ImageReference) -> RequestBuilder {
        let credential = self
            .credentials
            .credential_for(&image.registry)
            .or_else(|| self.credentials.credential_for(image.api_host()));

        match credential {
            Some(RegistryCredential::Basic { username, password }) => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            Some(RegistryCredential::Bearer(token)) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn fetch_manifest_digest(
        &self,
        image: &ImageReference,
        url: &str,
    ) -> Result<String, ResolutionFailure> {
        debug!("Fetching manifest digest for {} from URL {}", image, url);
        let request = self
            .client
            .head(url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES);
        let response = self
            .authorize(request, image)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(ResolutionFailure::Status(response.status().as_u16()));
        }
        digest_from_headers(response.headers())
    }
}

#[async_trait]
impl DigestResolver for OciRegistryResolver {
    async fn resolve_digest(&self, image: &ImageReference) -> Result<String, ResolutionError> {
        let tag = image
            .tag
            .as_deref()
            .ok_or_else(|| ResolutionError::new(image, ResolutionFailure::MissingTag))?;
        let base_url = self.base_url(image);

        let url = format!("{}/v2/{}/manifests/{}", base_url, image.repository, tag);
        let primary = self.fetch_manifest_digest(image, &url).await;

        let digest = match primary {
            Ok(digest) => digest,
            Err(failure) if self.enable_jfrog_artifactory_fallback => {
                info!(
                    "Falling back to JFrog Artifactory specific Repository Path Method for {} after: {}",
                    image, failure
                );
                let repository_name = image
                    .repository
                    .split('/')
                    .next()
                    .unwrap_or(&image.repository);
                // Create URL according to JFrog Artifactory's Repository Path Method (https://jfrog.com/help/r/jfrog-artifactory-documentation/the-repository-path-method-for-docker)
                let fallback_url = format!(
                    "{}/artifactory/api/docker/{}/v2/{}/manifests/{}",
                    base_url, repository_name, image.repository, tag
                );
                self.fetch_manifest_digest(image, &fallback_url)
                    .await
                    .map_err(|failure| ResolutionError::new(image, failure))?
            }
            Err(failure) => return Err(ResolutionError::new(image, failure)),
        };

        debug!("Registry serves digest {} for {}", digest, image);
        Ok(digest)
    }
}

fn classify_transport_error(error: reqwest::Error) -> ResolutionFailure {
    if error.is_timeout() {
        ResolutionFailure::Timeout
    } else {
        ResolutionFailure::Transport(error.to_string())
    }
}

fn digest_from_headers(headers: &HeaderMap) -> Result<String, ResolutionFailure> {
    let value = headers
        .get(DIGEST_HEADER)
        .ok_or(ResolutionFailure::MissingDigest)?
        .to_str()
        .map_err(|_| ResolutionFailure::InvalidDigest("<non UTF-8 header>".to_string()))?
        .trim();

    if !is_valid_digest(value) {
        return Err(ResolutionFailure::InvalidDigest(value.to_string()));
    }
    Ok(value.to_string())
}
