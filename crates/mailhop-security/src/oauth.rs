use crate::SecurityError;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};

#[derive(Debug, Clone)]
pub struct OAuthTokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Refresh-token grant for providers whose mailbox API takes bearer tokens.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    client_id: String,
    client_secret: Option<String>,
    token_url: String,
    http: reqwest::Client,
}

impl OAuthRefresher {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Option<String>,
        token_url: impl Into<String>,
    ) -> Result<Self, SecurityError> {
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client_id: client_id.into(),
            client_secret,
            token_url: token_url.into(),
            http,
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResult, SecurityError> {
        let mut client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_token_uri(TokenUrl::new(self.token_url.clone())?);
        if let Some(secret) = &self.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let token = client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(|err| SecurityError::OAuth(err.to_string()))?;

        let expires_at = token.expires_in().and_then(|lifetime| {
            Duration::from_std(lifetime)
                .ok()
                .map(|lifetime| Utc::now() + lifetime)
        });

        Ok(OAuthTokenResult {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token
                .refresh_token()
                .map(|token| token.secret().to_string()),
            expires_at,
        })
    }
}
