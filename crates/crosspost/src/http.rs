//! JSON-over-HTTP collaborators.
//!
//! Each pipeline collaborator is a small service:
//!
//! | Call        | Endpoint                       |
//! |-------------|--------------------------------|
//! | discovery   | `POST {discovery}/search`      |
//! | download    | `POST {downloader}/fetch`      |
//! | transform   | `POST {transformer}/process`   |
//! | caption     | `POST {captioner}/caption`     |
//! | publish     | `POST {publisher}/publish`     |
//! | engagement  | `GET {publisher}/engagement/{id}` |
//!
//! Failures are classified from the HTTP status so the state machine can
//! decide what to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crosspost_analytics::Engagement;
use crosspost_pipeline::{
    Artifact, Candidate, Caption, Captioner, CollaboratorError, Collaborators, Discovery,
    Downloader, EditingOptions, EngagementSource, ErrorKind, Publisher, Receipt, SearchFilters,
    Transformer,
};

use crate::settings::ServiceSettings;

/// Base URLs of the collaborator services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub discovery: String,
    pub downloader: String,
    pub transformer: String,
    pub captioner: String,
    pub publisher: String,
}

impl Endpoints {
    /// Every collaborator on one service.
    #[cfg(test)]
    pub fn single(base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        Self {
            discovery: base.clone(),
            downloader: base.clone(),
            transformer: base.clone(),
            captioner: base.clone(),
            publisher: base,
        }
    }
}

impl From<&ServiceSettings> for Endpoints {
    fn from(s: &ServiceSettings) -> Self {
        Self {
            discovery: s.discovery().to_string(),
            downloader: s.downloader().to_string(),
            transformer: s.transformer().to_string(),
            captioner: s.captioner().to_string(),
            publisher: s.publisher().to_string(),
        }
    }
}

/// Map a non-success status to an error kind.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthFailure,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorKind::Transient,
        s if s.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

fn transport_error(endpoint: &str, err: reqwest::Error) -> CollaboratorError {
    let kind = if err.is_builder() {
        ErrorKind::Permanent
    } else {
        // Connect failures, timeouts and dropped connections are all worth another try.
        ErrorKind::Transient
    };
    CollaboratorError::new(kind, format!("{endpoint}: {err}"))
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    keywords: &'a [String],
    filters: &'a SearchFilters,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    candidate: &'a Candidate,
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    artifact: &'a Artifact,
    options: &'a EditingOptions,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    artifact: &'a Artifact,
    caption: &'a str,
    tags: &'a [String],
}

/// Client for all collaborator services.
pub struct HttpCollaborators {
    http: Client,
    endpoints: Endpoints,
    publish_token: Option<String>,
}

impl HttpCollaborators {
    pub fn new(
        endpoints: Endpoints,
        publish_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            http,
            endpoints,
            publish_token,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Share one client across every collaborator seam.
    pub fn into_collaborators(self: Arc<Self>) -> Collaborators {
        Collaborators {
            discovery: self.clone(),
            downloader: self.clone(),
            transformer: self.clone(),
            captioner: self.clone(),
            publisher: self,
        }
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.publish_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<T, CollaboratorError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status);
            debug!(endpoint, %status, %kind, "collaborator call failed");
            return Err(CollaboratorError::new(
                kind,
                format!("{endpoint} failed ({status}): {}", body.trim()),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            CollaboratorError::permanent(format!("{endpoint}: invalid response: {e}"))
        })
    }
}

#[async_trait]
impl Discovery for HttpCollaborators {
    async fn find(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>, CollaboratorError> {
        let request = self
            .http
            .post(Self::url(&self.endpoints.discovery, "search"))
            .json(&SearchRequest { keywords, filters });
        self.send("search", request).await
    }
}

#[async_trait]
impl Downloader for HttpCollaborators {
    async fn fetch(&self, candidate: &Candidate) -> Result<Artifact, CollaboratorError> {
        let request = self
            .http
            .post(Self::url(&self.endpoints.downloader, "fetch"))
            .json(&FetchRequest { candidate });
        self.send("fetch", request).await
    }
}

#[async_trait]
impl Transformer for HttpCollaborators {
    async fn process(
        &self,
        artifact: &Artifact,
        options: &EditingOptions,
    ) -> Result<Artifact, CollaboratorError> {
        let request = self
            .http
            .post(Self::url(&self.endpoints.transformer, "process"))
            .json(&ProcessRequest { artifact, options });
        self.send("process", request).await
    }
}

#[async_trait]
impl Captioner for HttpCollaborators {
    async fn generate(&self, candidate: &Candidate) -> Result<Caption, CollaboratorError> {
        let request = self
            .http
            .post(Self::url(&self.endpoints.captioner, "caption"))
            .json(&FetchRequest { candidate });
        self.send("caption", request).await
    }
}

#[async_trait]
impl Publisher for HttpCollaborators {
    async fn publish(
        &self,
        artifact: &Artifact,
        caption: &str,
        tags: &[String],
    ) -> Result<Receipt, CollaboratorError> {
        let request = self.authorized(
            self.http
                .post(Self::url(&self.endpoints.publisher, "publish"))
                .json(&PublishRequest {
                    artifact,
                    caption,
                    tags,
                }),
        );
        self.send("publish", request).await
    }
}

#[async_trait]
impl EngagementSource for HttpCollaborators {
    async fn fetch(&self, external_id: &str) -> Result<Engagement, CollaboratorError> {
        let mut url = Url::parse(&self.endpoints.publisher)
            .map_err(|e| CollaboratorError::permanent(format!("invalid publisher url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::permanent("publisher url cannot take a path"))?
            .pop_if_empty()
            .push("engagement")
            .push(external_id);

        let request = self.authorized(self.http.get(url));
        self.send("engagement", request).await
    }
}
