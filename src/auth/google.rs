use super::loopback::LoopbackReceiver;
use super::types::{AccessToken, ClientSecrets, OAuthToken, ServiceAccountKey};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use console::style;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration as StdDuration;
use tracing::{debug, info};
use url::Url;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const CONSENT_TIMEOUT: StdDuration = StdDuration::from_secs(300);

/// The authorization server side of the credential lifecycle.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// First-run authorization; may require the operator to grant consent.
    async fn authorize(&self, client: &ClientSecrets, scopes: &[&str]) -> Result<OAuthToken>;
    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken>;
    async fn service_account_token(
        &self,
        key: &ServiceAccountKey,
        scopes: &[&str],
    ) -> Result<AccessToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct GoogleAuth {
    client: Client,
    redirect_port: u16,
}

/// Token endpoint answers: 400/401 mean the grant itself is bad, anything
/// 5xx/429 is worth another try later.
async fn token_error(response: Response, action: &str) -> BackupError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let msg = format!("{} failed: {} - {}", action, status, text);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackupError::UploadTransient(msg)
    } else {
        BackupError::AuthenticationRejected(msg)
    }
}

fn pkce_pair() -> (String, String) {
    let verifier = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

impl GoogleAuth {
    pub fn new(redirect_port: u16) -> Result<Self> {
        let client = Client::builder()
            .user_agent("pg-drive-backup/0.1")
            .timeout(StdDuration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            redirect_port,
        })
    }

    async fn post_token_form(&self, token_uri: &str, form: &[(&str, &str)], action: &str) -> Result<TokenResponse> {
        let response = self.client.post(token_uri).form(form).send().await?;
        if !response.status().is_success() {
            return Err(token_error(response, action).await);
        }
        Ok(response.json().await?)
    }

    fn authorization_url(
        client: &ClientSecrets,
        scopes: &[&str],
        redirect_uri: &str,
        state: &str,
        challenge: &str,
    ) -> Result<Url> {
        let scope = scopes.join(" ");
        Url::parse_with_params(
            &client.auth_uri,
            &[
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| BackupError::Config(format!("invalid auth_uri {:?}: {}", client.auth_uri, e)))
    }
}

#[async_trait]
impl TokenEndpoint for GoogleAuth {
    async fn authorize(&self, client: &ClientSecrets, scopes: &[&str]) -> Result<OAuthToken> {
        let receiver = LoopbackReceiver::bind(self.redirect_port).await?;
        let redirect_uri = receiver.redirect_uri();
        let state = uuid::Uuid::new_v4().simple().to_string();
        let (verifier, challenge) = pkce_pair();
        let url = Self::authorization_url(client, scopes, &redirect_uri, &state, &challenge)?;

        println!();
        println!("{}", style("Google Drive authorization required").cyan().bold());
        println!("Open this URL in a browser on this machine and grant access:");
        println!();
        println!("  {}", style(url.as_str()).underlined());
        println!();
        println!(
            "{}",
            style(format!("Waiting for the redirect to {} ...", redirect_uri)).dim()
        );

        let code = receiver.wait_for_code(&state, CONSENT_TIMEOUT).await?;
        let response = self
            .post_token_form(
                &client.token_uri,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("client_id", client.client_id.as_str()),
                    ("client_secret", client.client_secret.as_str()),
                    ("redirect_uri", redirect_uri.as_str()),
                    ("code_verifier", verifier.as_str()),
                ],
                "authorization code exchange",
            )
            .await?;

        if response.refresh_token.is_none() {
            return Err(BackupError::AuthenticationMissing(
                "authorization succeeded but Google returned no refresh token; revoke the app's access and run authorize again".to_string(),
            ));
        }
        info!("Authorization code exchanged for a token");

        Ok(OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expiry: response.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            token_uri: client.token_uri.clone(),
            client_id: client.client_id.clone(),
            client_secret: client.client_secret.clone(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            BackupError::AuthenticationRejected("token has no refresh token".to_string())
        })?;
        debug!("Refreshing OAuth token at {}", token.token_uri);

        let response = self
            .post_token_form(
                &token.token_uri,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", token.client_id.as_str()),
                    ("client_secret", token.client_secret.as_str()),
                ],
                "token refresh",
            )
            .await?;

        Ok(OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| token.refresh_token.clone()),
            expiry: response.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            token_uri: token.token_uri.clone(),
            client_id: token.client_id.clone(),
            client_secret: token.client_secret.clone(),
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| token.scopes.clone()),
        })
    }

    async fn service_account_token(
        &self,
        key: &ServiceAccountKey,
        scopes: &[&str],
    ) -> Result<AccessToken> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: scopes.join(" "),
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        let assertion = encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
        )?;

        debug!("Requesting service account token for {}", key.client_email);
        let response = self
            .post_token_form(
                &key.token_uri,
                &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                "service account token request",
            )
            .await?;

        Ok(AccessToken {
            token: response.access_token,
            expires_at: Utc::now()
                + Duration::seconds(response.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS)),
        })
    }
}
