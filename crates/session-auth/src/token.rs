//! Login and token refresh
//!
//! Handles the two auth endpoint interactions:
//! 1. Login (username/password exchange for a token pair + identity)
//! 2. Token refresh (refresh token exchange for a new access token)
//!
//! Both POST JSON to the auth base URL, which may differ from the API origin.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::constants::{DEFAULT_LOGIN_TYPE, LOGIN_PATH, REFRESH_PATH};
use crate::credentials::{Identity, TokenPair};
use crate::error::{Error, Result};
use crate::expiry::Expiry;

/// Login form as submitted by the user.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: Secret<String>,
    #[serde(default = "default_login_type")]
    pub login_type: String,
    #[serde(default)]
    pub captcha_token: Option<Secret<String>>,
}

fn default_login_type() -> String {
    DEFAULT_LOGIN_TYPE.to_string()
}

/// Successful login response.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_expires_at: Option<Expiry>,
    #[serde(default)]
    pub refresh_expires_at: Option<Expiry>,
    pub identity: Identity,
}

impl LoginResponse {
    pub fn into_parts(self) -> (TokenPair, Identity) {
        (
            TokenPair {
                access_token: self.access_token,
                refresh_token: self.refresh_token,
                access_expires_at: self.access_expires_at,
                refresh_expires_at: self.refresh_expires_at,
            },
            self.identity,
        )
    }
}

/// Raw refresh endpoint body: `{status, accessToken?, refreshToken?}`.
///
/// `status`, `reason` and `message` are informational and read leniently,
/// so an odd value in one of them never discards the tokens.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_expires_at: Option<Expiry>,
    #[serde(default)]
    refresh_expires_at: Option<Expiry>,
    #[serde(default)]
    reason: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
}

impl RefreshBody {
    fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case("error"))
    }

    fn reason(&self) -> Option<&str> {
        [&self.reason, &self.message]
            .into_iter()
            .find_map(|field| field.as_ref().and_then(Value::as_str))
    }
}

/// A refresh the server accepted. Fields the server omitted are filled
/// from the previous pair by `into_pair`.
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_expires_at: Option<Expiry>,
    pub refresh_expires_at: Option<Expiry>,
}

impl RefreshedTokens {
    /// Build the replacement pair.
    ///
    /// Without a rotated refresh token the previous one is kept, along with
    /// its expiry. Without an access expiry, `issued_at + access_ttl` is used.
    pub fn into_pair(
        self,
        previous: &TokenPair,
        issued_at: DateTime<Utc>,
        access_ttl: Duration,
    ) -> TokenPair {
        let access_expires_at = self.access_expires_at.or_else(|| {
            chrono::Duration::from_std(access_ttl)
                .ok()
                .map(|ttl| Expiry::from_datetime(issued_at + ttl))
        });
        let (refresh_token, refresh_expires_at) = match self.refresh_token {
            Some(rotated) => (rotated, self.refresh_expires_at),
            None => (
                previous.refresh_token.clone(),
                self.refresh_expires_at
                    .or_else(|| previous.refresh_expires_at.clone()),
            ),
        };
        TokenPair {
            access_token: self.access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        }
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn transport_error(what: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{what} request timed out: {e}"))
    } else {
        Error::Http(format!("{what} request failed: {e}"))
    }
}

/// Exchange user credentials for a token pair and identity.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    request: &LoginRequest,
    timeout: Duration,
) -> Result<LoginResponse> {
    let body = serde_json::json!({
        "username": request.username,
        "password": request.password.expose(),
        "loginType": request.login_type,
        "captchaToken": request.captcha_token.as_ref().map(|t| t.expose()),
    });

    let response = client
        .post(endpoint(base_url, LOGIN_PATH))
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| transport_error("login", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "login rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "login endpoint returned {status}: {body}"
        )));
    }

    debug!(username = %request.username, login_type = %request.login_type, "login accepted");

    response
        .json::<LoginResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))
}

/// Exchange a refresh token for a new access token.
///
/// A `status: "error"` body, a body without `accessToken`, or a 401/403 all
/// mean the server rejected the refresh token (`InvalidCredentials`).
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<RefreshedTokens> {
    let response = client
        .post(endpoint(base_url, REFRESH_PATH))
        .timeout(timeout)
        .json(&serde_json::json!({ "refreshToken": refresh }))
        .send()
        .await
        .map_err(|e| transport_error("token refresh", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let body = response
        .json::<RefreshBody>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    if body.is_error() {
        return Err(Error::InvalidCredentials(format!(
            "refresh token rejected: {}",
            body.reason().unwrap_or("no reason given")
        )));
    }

    let access_token = body.access_token.ok_or_else(|| {
        Error::InvalidCredentials("refresh response carried no accessToken".into())
    })?;

    Ok(RefreshedTokens {
        access_token,
        refresh_token: body.refresh_token,
        access_expires_at: body.access_expires_at,
        refresh_expires_at: body.refresh_expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn login_request() -> LoginRequest {
        serde_json::from_value(serde_json::json!({
            "username": "dana",
            "password": "pa55",
            "loginType": "password",
            "captchaToken": "cap-1"
        }))
        .unwrap()
    }

    fn previous_pair() -> TokenPair {
        TokenPair {
            access_token: "A1".into(),
            refresh_token: "R1".into(),
            access_expires_at: Some(Expiry::Millis(1)),
            refresh_expires_at: Some(Expiry::Millis(4_102_444_800_000)),
        }
    }

    #[test]
    fn login_request_debug_hides_password_and_captcha() {
        let debug = format!("{:?}", login_request());
        assert!(!debug.contains("pa55"));
        assert!(!debug.contains("cap-1"));
        assert!(debug.contains("dana"));
    }

    #[test]
    fn login_type_defaults_when_omitted() {
        let request: LoginRequest =
            serde_json::from_str(r#"{"username":"dana","password":"x"}"#).unwrap();
        assert_eq!(request.login_type, DEFAULT_LOGIN_TYPE);
        assert!(request.captcha_token.is_none());
    }

    #[tokio::test]
    async fn login_posts_form_and_parses_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(serde_json::json!({
                "username": "dana",
                "password": "pa55",
                "loginType": "password",
                "captchaToken": "cap-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "A1",
                "refreshToken": "R1",
                "accessExpiresAt": 4102444800000i64,
                "refreshExpiresAt": "2100-01-01T00:00:00Z",
                "identity": {"userId": 42, "tenantId": "acme", "role": "admin"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = login(&client, &server.uri(), &login_request(), TIMEOUT)
            .await
            .unwrap();
        let (tokens, identity) = response.into_parts();

        assert_eq!(tokens.access_token, "A1");
        assert_eq!(tokens.refresh_token, "R1");
        assert_eq!(tokens.access_expires_at, Some(Expiry::Millis(4_102_444_800_000)));
        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.tenant_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn login_rejection_is_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = login(&client, &server.uri(), &login_request(), TIMEOUT).await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn refresh_success_returns_new_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(serde_json::json!({"refreshToken": "R1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "accessToken": "A2",
                "refreshToken": "R2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let refreshed = refresh_token(&client, &format!("{}/", server.uri()), "R1", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "A2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn refresh_status_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "message": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_token(&client, &server.uri(), "R1", TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidCredentials(ref m) if m.contains("revoked")));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn refresh_success_tolerates_message_and_reason_together() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "accessToken": "A2",
                "message": "ok",
                "reason": "rotated"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let refreshed = refresh_token(&client, &server.uri(), "R1", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "A2");
        assert!(refreshed.refresh_token.is_none());
    }

    #[tokio::test]
    async fn refresh_success_tolerates_odd_informational_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 0,
                "accessToken": "A2",
                "refreshToken": "R2",
                "reason": {"code": "ROTATED"}
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let refreshed = refresh_token(&client, &server.uri(), "R1", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "A2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn refresh_rejection_reason_falls_back_to_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "reason": null,
                "message": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_token(&client, &server.uri(), "R1", TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidCredentials(ref m) if m.contains("revoked")), "got {err:?}");
    }

    #[tokio::test]
    async fn refresh_401_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = refresh_token(&client, &server.uri(), "R1", TIMEOUT).await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn refresh_5xx_is_token_exchange_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = refresh_token(&client, &server.uri(), "R1", TIMEOUT).await;
        assert!(matches!(result, Err(Error::TokenExchange(_))));
    }

    #[tokio::test]
    async fn refresh_unreachable_is_transport_error() {
        let client = reqwest::Client::new();
        let err = refresh_token(&client, "http://127.0.0.1:1", "R1", TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn refresh_slower_than_timeout_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"status": "success", "accessToken": "A2"})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_token(&client, &server.uri(), "R1", Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[test]
    fn into_pair_keeps_refresh_token_when_not_rotated() {
        let issued_at = Utc::now();
        let refreshed = RefreshedTokens {
            access_token: "A2".into(),
            refresh_token: None,
            access_expires_at: None,
            refresh_expires_at: None,
        };

        let pair = refreshed.into_pair(&previous_pair(), issued_at, Duration::from_secs(900));
        assert_eq!(pair.access_token, "A2");
        assert_eq!(pair.refresh_token, "R1");
        assert_eq!(pair.refresh_expires_at, Some(Expiry::Millis(4_102_444_800_000)));
        assert_eq!(
            pair.access_expires_at,
            Some(Expiry::Millis(
                (issued_at + chrono::Duration::seconds(900)).timestamp_millis()
            ))
        );
    }

    #[test]
    fn into_pair_takes_rotated_refresh_token_and_server_expiries() {
        let refreshed = RefreshedTokens {
            access_token: "A2".into(),
            refresh_token: Some("R2".into()),
            access_expires_at: Some(Expiry::Millis(5)),
            refresh_expires_at: Some(Expiry::Millis(6)),
        };

        let pair = refreshed.into_pair(&previous_pair(), Utc::now(), Duration::from_secs(900));
        assert_eq!(pair.refresh_token, "R2");
        assert_eq!(pair.access_expires_at, Some(Expiry::Millis(5)));
        assert_eq!(pair.refresh_expires_at, Some(Expiry::Millis(6)));
    }
}
