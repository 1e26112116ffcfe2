//! Discord OAuth: proves who opened a verify link

use serde::Deserialize;

const AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
const TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
const CURRENT_USER_URL: &str = "https://discord.com/api/users/@me";

/// OAuth configuration
#[derive(Clone)]
pub struct OAuthState {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub http_client: reqwest::Client,
}

impl OAuthState {
    /// None unless both client credentials are set
    pub fn from_env(base_url: &str) -> Option<Self> {
        let client_id = std::env::var("DISCORD_CLIENT_ID").ok()?;
        let client_secret = std::env::var("DISCORD_CLIENT_SECRET").ok()?;

        Some(Self {
            client_id,
            client_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/callback", self.base_url)
    }

    /// Authorization URL carrying the verify token through as `state`
    pub fn authorize_url(&self, token: &str) -> String {
        format!(
            "{}\
            ?client_id={}\
            &redirect_uri={}\
            &response_type=code\
            &scope=identify\
            &state={}",
            AUTHORIZE_URL,
            self.client_id,
            urlencoding::encode(&self.redirect_uri()),
            urlencoding::encode(token)
        )
    }

    /// Trade an authorization code for the Discord user who granted it
    pub async fn fetch_user(&self, code: &str) -> Result<DiscordUser, String> {
        let redirect_uri = self.redirect_uri();
        let token_response = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| format!("Failed to exchange code: {}", e))?;

        if !token_response.status().is_success() {
            let error_text = token_response.text().await.unwrap_or_default();
            return Err(format!("Token exchange failed: {}", error_text));
        }

        let token: TokenResponse = token_response
            .json()
            .await
            .map_err(|e| format!("Failed to parse token response: {}", e))?;

        let user_response = self
            .http_client
            .get(CURRENT_USER_URL)
            .header(
                "Authorization",
                format!("{} {}", token.token_type, token.access_token),
            )
            .send()
            .await
            .map_err(|e| format!("Failed to get user info: {}", e))?;

        if !user_response.status().is_success() {
            let error_text = user_response.text().await.unwrap_or_default();
            return Err(format!("User info request failed: {}", error_text));
        }

        user_response
            .json()
            .await
            .map_err(|e| format!("Failed to parse user info: {}", e))
    }
}

/// Discord OAuth token response
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// Discord user info from /users/@me
#[derive(Deserialize, Debug)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
}
