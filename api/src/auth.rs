//! OAuth cookie auth (§6.1, §10.6): business-logic-free pass-through. Login
//! redirects to GitHub's OAuth authorize URL; callback exchanges the code
//! for a user access token and wraps it in a signed, cookie-stored JWT;
//! logout clears the cookie; profile reads the JWT back out. None of this
//! touches `ForgeClient` — that trait is scoped to GitHub-App installation
//! tokens, not end-user OAuth tokens, so this is a separate concern built
//! directly on `jsonwebtoken` + `reqwest`.

use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};
use crate::state::{AppState, OAuthConfig};

const COOKIE_NAME: &str = "auth_token";
const SESSION_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Forge login of the authenticated user.
    pub sub: String,
    /// The user's own GitHub OAuth access token, carried so downstream
    /// handlers (user-organizations, repo listing) can call GitHub as them.
    pub access_token: String,
    pub exp: i64,
}

pub fn mint_cookie(claims: &AuthClaims, jwt_secret: &str) -> Result<String> {
    let token = jsonwebtoken::encode(&Header::default(), claims, &EncodingKey::from_secret(jwt_secret.as_bytes()))
        .map_err(|e| ApiError::Other(e.into()))?;
    Ok(format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax"))
}

fn decode_cookie(headers: &HeaderMap, jwt_secret: &str) -> Option<AuthClaims> {
    let cookie_header = headers.get(COOKIE)?.to_str().ok()?;
    let token = cookie_header.split(';').map(|s| s.trim()).find_map(|kv| kv.strip_prefix(&format!("{COOKIE_NAME}=")))?;
    jsonwebtoken::decode::<AuthClaims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Axum extractor: `AuthUser(claims): AuthUser`. Requires `AppState` so it
/// can read the configured JWT secret.
pub struct AuthUser(pub AuthClaims);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        decode_cookie(&parts.headers, &state.oauth.jwt_secret)
            .map(AuthUser)
            .ok_or_else(|| ApiError::Unauthorized("missing or invalid auth_token cookie".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Where to send the browser after a successful callback.
    pub redirect: Option<String>,
}

pub async fn login(State(state): State<AppState>, Query(query): Query<LoginQuery>) -> Response {
    let redirect = query.redirect.unwrap_or_else(|| state.frontend_url.clone());
    let authorize_url = format!(
        "https://github.com/login/oauth/authorize?client_id={}&scope=read:org,repo&state={}",
        state.oauth.client_id,
        percent_encode(&redirect),
    );
    Redirect::temporary(&authorize_url).into_response()
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
    email: Option<String>,
}

pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Result<Response> {
    let client = reqwest::Client::new();
    let token_resp: AccessTokenResponse = client
        .post("https://github.com/login/oauth/access_token")
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("client_id", state.oauth.client_id.as_str()),
            ("client_secret", state.oauth.client_secret.as_str()),
            ("code", query.code.as_str()),
        ])
        .send()
        .await
        .map_err(|e| ApiError::Other(e.into()))?
        .json()
        .await
        .map_err(|e| ApiError::Other(e.into()))?;

    let user: GithubUser = client
        .get("https://api.github.com/user")
        .bearer_auth(&token_resp.access_token)
        .header(reqwest::header::USER_AGENT, "previewctl")
        .send()
        .await
        .map_err(|e| ApiError::Other(e.into()))?
        .json()
        .await
        .map_err(|e| ApiError::Other(e.into()))?;

    state.users.upsert(&user.login, user.email.as_deref()).await.map_err(ApiError::from)?;

    let claims = AuthClaims {
        sub: user.login,
        access_token: token_resp.access_token,
        exp: chrono::Utc::now().timestamp() + SESSION_TTL_SECS,
    };
    let cookie = mint_cookie(&claims, &state.oauth.jwt_secret)?;

    let redirect_to = query.state.unwrap_or_else(|| state.frontend_url.clone());
    let mut response = Redirect::temporary(&redirect_to).into_response();
    response
        .headers_mut()
        .insert(SET_COOKIE, HeaderValue::from_str(&cookie).map_err(|e| ApiError::Other(e.into()))?);
    Ok(response)
}

pub async fn logout(State(state): State<AppState>) -> Response {
    let mut response = Redirect::temporary(&state.frontend_url).into_response();
    let expired = format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if let Ok(value) = HeaderValue::from_str(&expired) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub login: String,
}

pub async fn profile(AuthUser(claims): AuthUser) -> Json<ProfileResponse> {
    Json(ProfileResponse { login: claims.sub })
}

pub fn oauth_config(args: &crate::args::OAuthArgs) -> OAuthConfig {
    OAuthConfig {
        client_id: args.client_id.clone(),
        client_secret: args.client_secret.clone(),
        jwt_secret: args.jwt_secret.clone(),
        allowed_origin: args.allowed_origin.clone(),
    }
}

pub fn unauthorized() -> StatusCode {
    StatusCode::UNAUTHORIZED
}
