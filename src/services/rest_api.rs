/**
 * REQUIREMENT: The collaboration server consults the REST API for user lookups
 * and project access checks; it owns no annotation storage of its own
 * PURPOSE: Outbound REST collaborator client with retry and circuit breaking
 */
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CollabError, CollabResult};
use crate::services::resilience::{retry_with_backoff, CircuitBreaker, RetryPolicy};

/// User record as returned by `GET /api/users/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Membership detail from `GET /api/projects/{id}/members/{userId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMembership {
    pub user_id: String,
    pub project_id: String,
    #[serde(default)]
    pub role: String,
}

pub struct RestApiClient {
    http: Client,
    base_url: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

const REST_CALL_TIMEOUT: Duration = Duration::from_secs(5);

impl RestApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::with_defaults("rest-api"),
            retry: RetryPolicy::default(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> CollabResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let http = self.http.clone();
        self.breaker
            .call(REST_CALL_TIMEOUT, async move {
                let response = http.get(&url).send().await?;
                if !response.status().is_success() {
                    return Err(CollabError::Connection(format!(
                        "REST API returned {} for {}",
                        response.status(),
                        url
                    )));
                }
                Ok(response.json::<T>().await?)
            })
            .await
    }

    /// Resolve a user record; 4xx responses are treated as `UserNotFound`
    pub async fn lookup_user(&self, user_id: &str) -> CollabResult<RestUser> {
        let url = format!("{}/api/users/{}", self.base_url, user_id);
        let http = self.http.clone();
        let user_id_owned = user_id.to_string();
        self.breaker
            .call(REST_CALL_TIMEOUT, async move {
                let response = http.get(&url).send().await?;
                let status = response.status();
                if status.is_client_error() {
                    return Err(CollabError::UserNotFound(user_id_owned));
                }
                if !status.is_success() {
                    return Err(CollabError::Connection(format!(
                        "user lookup returned {}",
                        status
                    )));
                }
                Ok(response.json::<RestUser>().await?)
            })
            .await
    }

    /// Boolean project access check; any 2xx allows the join.
    /// Transient REST failures (5xx, network) are retried before surfacing.
    pub async fn check_project_access(&self, project_id: &str, user_id: &str) -> CollabResult<bool> {
        let path = format!("/api/projects/{}/access/{}", project_id, user_id);
        retry_with_backoff(self.retry, "project access check", || async {
            let url = format!("{}{}", self.base_url, path);
            let http = self.http.clone();
            self.breaker
                .call(REST_CALL_TIMEOUT, async move {
                    let response = http.get(&url).send().await?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(true)
                    } else if status.is_client_error() {
                        Ok(false)
                    } else {
                        Err(CollabError::Connection(format!(
                            "access check returned {}",
                            status
                        )))
                    }
                })
                .await
        })
        .await
    }

    /// Membership detail for a project member
    pub async fn project_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> CollabResult<ProjectMembership> {
        self.get_json(&format!(
            "/api/projects/{}/members/{}",
            project_id, user_id
        ))
        .await
    }
}
