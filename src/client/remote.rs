use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use super::ClientError;
use crate::api::{SessionInfo, TrainingsSaved};
use crate::auth::Role;
use crate::models::{Profile, ProfilePayload, Training};
use crate::validation::ValidationResponse;

/// What the reconciler needs from the backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// The signed-in account, or `None` without a valid session.
    async fn session(&self) -> Result<Option<SessionInfo>, ClientError>;

    async fn fetch_profile(&self) -> Result<Option<Profile>, ClientError>;

    async fn upsert_profile(&self, profile: &ProfilePayload) -> Result<Profile, ClientError>;

    async fn set_avatar_url(&self, url: &str) -> Result<Profile, ClientError>;

    async fn set_role(&self, role: Role) -> Result<Profile, ClientError>;

    async fn fetch_trainings(&self) -> Result<Vec<Training>, ClientError>;

    async fn push_trainings(&self, trainings: &[Training]) -> Result<usize, ClientError>;

    /// `false` when the server had no such training.
    async fn delete_training(&self, id: i64) -> Result<bool, ClientError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Talks to the journal backend over HTTP. The session lives in the cookie jar.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = Client::builder().cookie_store(true).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/api{}", self.base_url, path))
    }

    #[instrument(skip(self, password))]
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SessionInfo, ClientError> {
        let response = self
            .request(Method::POST, "/auth/signup")
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        parse(response).await
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionInfo, ClientError> {
        let response = self
            .request(Method::POST, "/auth/signin")
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        parse(response).await
    }

    pub async fn sign_out(&self) -> Result<(), ClientError> {
        let response = self.request(Method::POST, "/auth/signout").send().await?;
        check(response).await.map(|_| ())
    }
}

/// Turns a non-success response into the matching `ClientError`.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ValidationResponse>(&body)
        .ok()
        .and_then(|v| v.first_message().map(str::to_string))
        .or_else(|| {
            serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .map(|e| e.message)
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string());

    debug!(status = status.as_u16(), %message, "Backend request failed");
    Err(match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized(message),
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        _ => ClientError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json::<T>().await?)
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn session(&self) -> Result<Option<SessionInfo>, ClientError> {
        let response = self.request(Method::GET, "/me").send().await?;
        match parse(response).await {
            Ok(session) => Ok(Some(session)),
            Err(ClientError::Unauthorized(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn fetch_profile(&self) -> Result<Option<Profile>, ClientError> {
        let response = self.request(Method::GET, "/profile").send().await?;
        match parse(response).await {
            Ok(profile) => Ok(Some(profile)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upsert_profile(&self, profile: &ProfilePayload) -> Result<Profile, ClientError> {
        let response = self
            .request(Method::PUT, "/profile")
            .json(profile)
            .send()
            .await?;
        parse(response).await
    }

    async fn set_avatar_url(&self, url: &str) -> Result<Profile, ClientError> {
        let response = self
            .request(Method::PATCH, "/profile/avatar")
            .json(&json!({ "avatar_url": url }))
            .send()
            .await?;
        parse(response).await
    }

    async fn set_role(&self, role: Role) -> Result<Profile, ClientError> {
        let response = self
            .request(Method::PUT, "/profile/role")
            .json(&json!({ "role": role }))
            .send()
            .await?;
        parse(response).await
    }

    async fn fetch_trainings(&self) -> Result<Vec<Training>, ClientError> {
        let response = self.request(Method::GET, "/trainings").send().await?;
        parse(response).await
    }

    async fn push_trainings(&self, trainings: &[Training]) -> Result<usize, ClientError> {
        let response = self
            .request(Method::PUT, "/trainings")
            .json(trainings)
            .send()
            .await?;
        let saved: TrainingsSaved = parse(response).await?;
        Ok(saved.saved)
    }

    async fn delete_training(&self, id: i64) -> Result<bool, ClientError> {
        let response = self
            .request(Method::DELETE, &format!("/trainings/{}", id))
            .send()
            .await?;
        match check(response).await {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
