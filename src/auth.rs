use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Username docker expects alongside a Google OAuth2 access token.
const GOOGLE_TOKEN_USERNAME: &str = "oauth2accesstoken";

#[derive(Error, Debug)]
pub enum Error {
    #[error("auth error: {0}")]
    AuthError(#[from] google_cloud_auth::error::Error),

    #[error("auth token error: {0}")]
    AuthTokenError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("unexpected response (status {0}): {1}")]
    Deserialize(u16, String),
}

/// How to authenticate against the destination registry.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Log in with a username and password before pushing.
    Basic { username: String, password: String },
    /// Whatever docker is already configured with.
    Ambient,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => write!(f, "Basic({username})"),
            Credentials::Ambient => f.write_str("Ambient"),
        }
    }
}

/// Google Artifact Registry and Container Registry hosts.
pub fn is_google_registry(registry: &str) -> bool {
    registry.ends_with("-docker.pkg.dev") || registry == "gcr.io" || registry.ends_with(".gcr.io")
}

/// Pick credentials for `registry`.
///
/// Explicit credentials win. Google registries get a fresh OAuth2 token when one can be
/// obtained; anything else falls back to docker's own configuration.
pub async fn resolve(
    registry: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
) -> Credentials {
    match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            debug!("use credentials --user and --password");
            return Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            };
        }
        (Some(_), _) | (_, Some(_)) => {
            warn!("--user and --password must be given together, ignoring them");
        }
        _ => {}
    }

    match registry {
        Some(registry) if is_google_registry(registry) => match token().await {
            Ok(token) => Credentials::Basic {
                username: GOOGLE_TOKEN_USERNAME.to_string(),
                password: token,
            },
            Err(err) => {
                warn!("no Google access token for {registry}, using docker credentials: {err}");
                Credentials::Ambient
            }
        },
        _ => Credentials::Ambient,
    }
}

/// Obtain an access token, through GitHub Actions workload identity federation when running in
/// a configured workflow, otherwise through Google default credentials.
pub async fn token() -> Result<String, Error> {
    let workload_identity_pool = std::env::var("WORKLOAD_IDENTITY_POOL").ok();
    let github_id_token_url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok();
    let github_token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok();

    match (workload_identity_pool, github_id_token_url, github_token) {
        (Some(workload_identity_pool), Some(github_id_token_url), Some(github_token)) => {
            let id_token =
                github_id_token(&github_id_token_url, &github_token, &workload_identity_pool)
                    .await?;
            exchange_federated_token(&workload_identity_pool, &id_token.value)
                .await
                .map(|token| token.access_token)
        }
        (_, _, _) => default_credentials_token().await,
    }
}

async fn default_credentials_token() -> Result<String, Error> {
    debug!("Exchanging Google credential file for an oauth2 token");

    use google_cloud_auth::{project::Config, token::DefaultTokenSourceProvider};
    use google_cloud_token::TokenSourceProvider as _;

    let audience = "https://oauth2.googleapis.com/token/";
    let scopes = ["https://www.googleapis.com/auth/cloud-platform"];

    let config = Config::default()
        .with_audience(audience)
        .with_scopes(&scopes);
    let tsp = DefaultTokenSourceProvider::new(config)
        .await
        .map_err(Error::AuthError)?;
    let ts = tsp.token_source();
    let token = ts.token().await.map_err(Error::AuthTokenError)?;
    Ok(strip_bearer(&token).to_string())
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    value: String,
}

fn client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .user_agent("sko")
        .build()?)
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    serde_json::from_slice(&bytes).map_err(|_| {
        let body = String::from_utf8_lossy(&bytes);
        Error::Deserialize(status, body.to_string())
    })
}

async fn exchange_federated_token(
    workload_identity_pool: &str,
    github_id_token: &str,
) -> Result<TokenExchangeResponse, Error> {
    debug!("Exchanging federated GitHub token for an oauth2 token");
    let request = TokenExchangeRequest {
        audience: &format!("//iam.googleapis.com/{workload_identity_pool}"),
        grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
        requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
        scope: "https://www.googleapis.com/auth/cloud-platform",
        subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
        subject_token: github_id_token,
    };

    let resp = client()?
        .post("https://sts.googleapis.com/v1/token")
        .json(&request)
        .send()
        .await?;
    decode(resp).await
}

async fn github_id_token(
    url: &str,
    bearer_token: &str,
    workload_identity_pool: &str,
) -> Result<GitHubTokenResponse, Error> {
    debug!("Getting GitHub actions id_token");
    let resp = client()?
        .get(url)
        .bearer_auth(bearer_token)
        .query(&[(
            "audience",
            format!("https://iam.googleapis.com/{workload_identity_pool}"),
        )])
        .send()
        .await?;
    decode(resp).await
}
