//! HTTP clients for a GoTrue-style identity service and the impersonation
//! authorization endpoint.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use url::Url;
use verity_storage::{StorageError, TabStorage};

use crate::authorization::{AuthorizationEndpoint, AuthorizationError, ExchangeGrant};
use crate::identity::{IdentityError, IdentityService};
use crate::session::{Identity, SESSION_KEY, Session};

const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token_hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    app_metadata: Option<AppMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct AppMetadata {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl ErrorBody {
    fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    fn code(&self) -> Option<&str> {
        self.error_code
            .as_deref()
            .or(self.reason.as_deref())
            .or(self.error.as_deref())
    }

    fn text(&self, raw: &str) -> String {
        self.msg
            .as_deref()
            .or(self.message.as_deref())
            .or(self.error_description.as_deref())
            .unwrap_or(raw)
            .to_string()
    }
}

impl UserResponse {
    fn into_identity(self) -> Identity {
        let role = self
            .app_metadata
            .and_then(|metadata| metadata.role)
            .or(self.role);
        Identity {
            user_id: self.id,
            email: self.email,
            role,
        }
    }
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
            .unwrap_or_else(|| {
                Utc::now() + chrono::Duration::seconds(self.expires_in.unwrap_or(3600))
            });
        Session {
            user_id: self.user.id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            device_fingerprint: None,
        }
    }
}

/// Parses `raw` so that relative endpoint paths join below it.
fn directory_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn transport_error(error: reqwest::Error) -> IdentityError {
    if error.is_timeout() {
        IdentityError::Timeout
    } else if error.is_decode() {
        IdentityError::Decode(error.to_string())
    } else {
        IdentityError::Network(error.to_string())
    }
}

/// Identity client persisting its session in shared storage under
/// [`SESSION_KEY`].
#[derive(Debug, Clone)]
pub struct HttpIdentityClient {
    client: Client,
    base_url: Url,
    api_key: String,
    storage: TabStorage,
}

impl HttpIdentityClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
        storage: TabStorage,
    ) -> Result<Self, IdentityError> {
        let base_url =
            directory_url(base_url).map_err(|error| IdentityError::Network(error.to_string()))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| IdentityError::Network(error.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            storage,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, IdentityError> {
        self.base_url
            .join(path)
            .map_err(|error| IdentityError::Network(error.to_string()))
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("apikey", &self.api_key)
    }

    fn persist(&self, session: &Session) -> Result<(), IdentityError> {
        self.storage
            .set_json(SESSION_KEY, session)
            .map_err(|error| IdentityError::Storage(error.to_string()))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, IdentityError> {
        let response = self.request(builder).send().await.map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, IdentityError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(transport_error);
        }

        let raw = response.text().await.unwrap_or_default();
        let body = ErrorBody::parse(&raw);
        let error = IdentityError::from_api(status.as_u16(), body.code(), &body.text(&raw));
        debug!(status = status.as_u16(), %error, "identity request failed");
        Err(error)
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<Session, IdentityError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let response: TokenResponse = self
            .send(self.client.post(url).json(&RefreshRequest { refresh_token }))
            .await?;
        let session = response.into_session();
        self.persist(&session)?;
        Ok(session)
    }
}

impl IdentityService for HttpIdentityClient {
    async fn get_session(&self) -> Result<Option<Session>, IdentityError> {
        match self.storage.get_json(SESSION_KEY) {
            Ok(session) => Ok(session),
            Err(StorageError::Serialization { reason, .. }) => {
                warn!(%reason, "discarding undecodable persisted session");
                self.storage
                    .remove(SESSION_KEY)
                    .map_err(|error| IdentityError::Storage(error.to_string()))?;
                Ok(None)
            }
            Err(error) => Err(IdentityError::Storage(error.to_string())),
        }
    }

    async fn refresh_session(&self) -> Result<Session, IdentityError> {
        let session = self.get_session().await?.ok_or(IdentityError::NoSession)?;
        self.refresh_with(&session.refresh_token).await
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        let session = self.get_session().await.unwrap_or_else(|error| {
            warn!(%error, "persisted session unreadable; skipping remote logout");
            None
        });
        if let Some(session) = session {
            let url = self.endpoint("auth/v1/logout")?;
            let outcome = self
                .request(self.client.post(url).bearer_auth(&session.access_token))
                .send()
                .await;
            match outcome {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = response.status().as_u16(), "remote logout rejected")
                }
                Err(error) => warn!(%error, "remote logout failed"),
            }
        }

        self.storage
            .remove(SESSION_KEY)
            .map_err(|error| IdentityError::Storage(error.to_string()))
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError> {
        let url = self.endpoint("auth/v1/user")?;
        let user: UserResponse = self
            .send(self.client.get(url).bearer_auth(access_token))
            .await?;
        Ok(user.into_identity())
    }

    async fn exchange_token(&self, token_hash: &str) -> Result<Session, IdentityError> {
        let url = self.endpoint("auth/v1/verify")?;
        let response: TokenResponse = self
            .send(self.client.post(url).json(&VerifyRequest {
                kind: "magiclink",
                token_hash,
            }))
            .await?;
        let session = response.into_session();
        self.persist(&session)?;
        Ok(session)
    }

    async fn set_session(&self, session: Session) -> Result<Session, IdentityError> {
        if session.is_expired() {
            return self.refresh_with(&session.refresh_token).await;
        }

        let identity = self.get_user(&session.access_token).await?;
        if identity.user_id != session.user_id {
            return Err(IdentityError::Unauthorized);
        }
        self.persist(&session)?;
        Ok(session)
    }
}

#[derive(Debug, Deserialize)]
struct CsrfResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    target: &'a str,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct EndRequest<'a> {
    admin_id: &'a str,
    target: &'a str,
}

/// Client for the impersonation authorization endpoint mounted at `base_url`
/// (`csrf-token`, `impersonate`, `impersonate/end`).
#[derive(Debug, Clone)]
pub struct HttpAuthorizationClient {
    client: Client,
    base_url: Url,
}

impl HttpAuthorizationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthorizationError> {
        let base_url = directory_url(base_url)
            .map_err(|error| AuthorizationError::Network(error.to_string()))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| AuthorizationError::Network(error.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthorizationError> {
        self.base_url
            .join(path)
            .map_err(|error| AuthorizationError::Network(error.to_string()))
    }

    async fn check(response: Response) -> Result<Response, AuthorizationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let raw = response.text().await.unwrap_or_default();
        let body = ErrorBody::parse(&raw);
        Err(AuthorizationError::from_reason(
            status.as_u16(),
            body.code(),
            &body.text(&raw),
        ))
    }
}

fn authorization_transport_error(error: reqwest::Error) -> AuthorizationError {
    if error.is_decode() {
        AuthorizationError::Decode(error.to_string())
    } else {
        AuthorizationError::Network(error.to_string())
    }
}

impl AuthorizationEndpoint for HttpAuthorizationClient {
    async fn fetch_csrf_token(&self, access_token: &str) -> Result<String, AuthorizationError> {
        let url = self.endpoint("csrf-token")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| AuthorizationError::CsrfUnavailable(error.to_string()))?;
        let response = Self::check(response)
            .await
            .map_err(|error| AuthorizationError::CsrfUnavailable(error.to_string()))?;
        let body: CsrfResponse = response
            .json()
            .await
            .map_err(|error| AuthorizationError::CsrfUnavailable(error.to_string()))?;
        Ok(body.token)
    }

    async fn request_exchange(
        &self,
        access_token: &str,
        csrf_token: &str,
        target: &str,
        reason: &str,
    ) -> Result<ExchangeGrant, AuthorizationError> {
        let url = self.endpoint("impersonate")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .header(CSRF_HEADER, csrf_token)
            .json(&ExchangeRequest { target, reason })
            .send()
            .await
            .map_err(authorization_transport_error)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(authorization_transport_error)
    }

    async fn end_impersonation(
        &self,
        access_token: &str,
        admin_id: &str,
        target: &str,
    ) -> Result<(), AuthorizationError> {
        let url = self.endpoint("impersonate/end")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&EndRequest { admin_id, target })
            .send()
            .await
            .map_err(authorization_transport_error)?;
        Self::check(response).await?;
        Ok(())
    }
}
