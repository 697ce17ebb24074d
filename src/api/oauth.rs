//
// OAuth 2.0 provider facade
//
// The authorize/token/userinfo/revoke request surface. Wire shapes follow
// RFC 6749/7009: form-urlencoded requests, `{error, error_description}`
// JSON errors, and a WWW-Authenticate header on userinfo failures. The
// engine in `crate::oauth` does the heavy lifting.
use std::io::Cursor;

use rocket::form::Form;
use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Redirect, Responder, Response};
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;
use url::Url;

use crate::{
    api::{api_ok, api_success, JsonResult},
    auth::{ClientIp, Headers},
    cache::USER_CACHE,
    db::models::{OauthClient, OauthClientId, OauthGrant, User, UserLog},
    db::DbConn,
    oauth::{self, OAuthError, OAuthErrorKind},
    ratelimit, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![authorize, authorize_consent, token, userinfo, revoke, list_grants, delete_grant]
}

//
// RFC 6749 error envelope
//
pub struct OAuthErrorResponse {
    error: OAuthError,
    www_authenticate: bool,
    status_override: Option<u16>,
}

impl From<OAuthError> for OAuthErrorResponse {
    fn from(error: OAuthError) -> Self {
        Self {
            error,
            www_authenticate: false,
            status_override: None,
        }
    }
}

impl OAuthErrorResponse {
    fn bearer(error: OAuthError) -> Self {
        Self {
            error,
            www_authenticate: true,
            status_override: None,
        }
    }

    fn rate_limited() -> Self {
        Self {
            error: OAuthError::new(OAuthErrorKind::InvalidRequest, "Too many token requests"),
            www_authenticate: false,
            status_override: Some(429),
        }
    }
}

impl Responder<'_, 'static> for OAuthErrorResponse {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        warn!("OAuth error: {}", self.error);

        let body = json!({
            "error": self.error.kind.as_str(),
            "error_description": self.error.description,
        })
        .to_string();

        let status = self.status_override.unwrap_or_else(|| self.error.kind.status());

        let mut builder = Response::build();
        builder
            .status(Status::new(status))
            .header(ContentType::JSON)
            .raw_header("Cache-Control", "no-store")
            .raw_header("Pragma", "no-cache");

        if self.www_authenticate {
            builder.raw_header(
                "WWW-Authenticate",
                format!(
                    "Bearer error=\"{}\", error_description=\"{}\"",
                    self.error.kind.as_str(),
                    self.error.description.replace('"', "'")
                ),
            );
        }

        builder.sized_body(Some(body.len()), Cursor::new(body)).ok()
    }
}

fn oauth_error(kind: OAuthErrorKind, description: &str) -> OAuthErrorResponse {
    OAuthErrorResponse::from(OAuthError::new(kind, description))
}

/// Appends query parameters to the validated redirect URI.
fn redirect_with_params(redirect_uri: &str, params: &[(&str, &str)]) -> Result<Redirect, OAuthErrorResponse> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|_| oauth_error(OAuthErrorKind::InvalidRequest, "redirect_uri is not a valid URL"))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            if !value.is_empty() {
                pairs.append_pair(key, value);
            }
        }
    }
    Ok(Redirect::to(url.to_string()))
}

/// Shared validation of the authorize-request tuple. Errors here are never
/// redirected to the client-supplied URI.
async fn validate_authorize_request(
    client_id: &str,
    redirect_uri: &str,
    conn: &DbConn,
) -> Result<OauthClient, OAuthErrorResponse> {
    let client = oauth::validate_client_id(client_id, conn).await?;

    // Exact string match. No prefix matching, no scheme upgrading, no
    // trailing-slash tolerance.
    if client.redirect_uri != redirect_uri {
        return Err(oauth_error(OAuthErrorKind::InvalidRequest, "redirect_uri does not match the registered value"));
    }

    Ok(client)
}

//
// GET /authorize: entry of the authorization-code flow.
//
#[get("/authorize?<client_id>&<redirect_uri>&<response_type>&<scope>&<state>")]
async fn authorize(
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_type: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    session: Option<Headers>,
    conn: DbConn,
) -> Result<Redirect, OAuthErrorResponse> {
    let (Some(client_id), Some(redirect_uri)) = (client_id, redirect_uri) else {
        return Err(oauth_error(OAuthErrorKind::InvalidRequest, "client_id and redirect_uri are required"));
    };

    let client = validate_authorize_request(&client_id, &redirect_uri, &conn).await?;
    let state = state.unwrap_or_default();

    // From here on the redirect URI is trusted; protocol errors go back to
    // the client application.
    if response_type.as_deref() != Some("code") {
        return redirect_with_params(&redirect_uri, &[("error", "unsupported_response_type"), ("state", &state)]);
    }

    let scope = match scope.as_deref().and_then(oauth::normalize_scope) {
        Some(scope) => scope,
        None => {
            return redirect_with_params(&redirect_uri, &[("error", "invalid_scope"), ("state", &state)]);
        }
    };

    if session.is_none() {
        // Not signed in: to the login page, then back here.
        let return_to = format!(
            "{}/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            CONFIG.domain,
            urlencode(&client_id),
            urlencode(&redirect_uri),
            urlencode(&scope),
            urlencode(&state),
        );
        return Ok(Redirect::to(format!("{}/login?return_to={}", CONFIG.domain, urlencode(&return_to))));
    }

    // Signed in and not banned (the guard enforces the ban gate): show the
    // consent page.
    Ok(Redirect::to(format!(
        "{}/oauth/consent?client_id={}&redirect_uri={}&scope={}&state={}&client_name={}",
        CONFIG.domain,
        urlencode(&client.client_id),
        urlencode(&redirect_uri),
        urlencode(&scope),
        urlencode(&state),
        urlencode(&client.name),
    )))
}

#[derive(FromForm)]
struct ConsentForm {
    client_id: String,
    redirect_uri: String,
    scope: String,
    state: Option<String>,
    decision: String,
}

//
// POST /authorize: the consent submission.
//
#[post("/authorize", data = "<data>")]
async fn authorize_consent(
    data: Form<ConsentForm>,
    headers: Headers,
    conn: DbConn,
) -> Result<Redirect, OAuthErrorResponse> {
    let data = data.into_inner();

    let client = validate_authorize_request(&data.client_id, &data.redirect_uri, &conn).await?;
    let state = data.state.unwrap_or_default();

    let scope = match oauth::normalize_scope(&data.scope) {
        Some(scope) => scope,
        None => {
            return redirect_with_params(&data.redirect_uri, &[("error", "invalid_scope"), ("state", &state)]);
        }
    };

    if data.decision != "approve" {
        return redirect_with_params(&data.redirect_uri, &[("error", "access_denied"), ("state", &state)]);
    }

    let code = oauth::issue_code(&client, headers.user.id, &data.redirect_uri, &scope, &conn).await?;

    UserLog::log(
        headers.user.id,
        "oauth-authorize",
        json!({"clientId": client.client_id, "scope": scope}),
        &conn,
    )
    .await;

    redirect_with_params(&data.redirect_uri, &[("code", &code), ("state", &state)])
}

#[derive(FromForm)]
struct TokenForm {
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    refresh_token: Option<String>,
}

//
// POST /token: code exchange and refresh rotation.
//
#[post("/token", data = "<data>")]
async fn token(
    data: Form<TokenForm>,
    ip: ClientIp,
    conn: DbConn,
) -> Result<Json<Value>, OAuthErrorResponse> {
    if ratelimit::check_limit_oauth_token(&ip.ip).is_err() {
        return Err(OAuthErrorResponse::rate_limited());
    }

    let data = data.into_inner();

    let (Some(client_id), Some(client_secret)) = (data.client_id.as_deref(), data.client_secret.as_deref()) else {
        return Err(oauth_error(OAuthErrorKind::InvalidClient, "Client authentication required"));
    };

    let client = oauth::validate_client(client_id, client_secret, &conn).await?;

    let (tokens, user_id) = match data.grant_type.as_str() {
        "authorization_code" => {
            let (Some(code), Some(redirect_uri)) = (data.code.as_deref(), data.redirect_uri.as_deref()) else {
                return Err(oauth_error(OAuthErrorKind::InvalidRequest, "code and redirect_uri are required"));
            };
            oauth::exchange_code(code, &client, redirect_uri, &conn).await?
        }
        "refresh_token" => {
            let Some(refresh_token) = data.refresh_token.as_deref() else {
                return Err(oauth_error(OAuthErrorKind::InvalidRequest, "refresh_token is required"));
            };
            oauth::refresh(refresh_token, &client, &conn).await?
        }
        _ => {
            return Err(oauth_error(OAuthErrorKind::UnsupportedGrantType, "Unsupported grant_type"));
        }
    };

    UserLog::log(user_id, "oauth-token", json!({"clientId": client.client_id}), &conn).await;

    Ok(Json(serde_json::to_value(&tokens).unwrap_or_default()))
}

/// Bearer extraction for the userinfo endpoint.
pub struct AccessBearer(String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AccessBearer {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one("Authorization").and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() => Outcome::Success(AccessBearer(token.to_string())),
            _ => Outcome::Error((Status::Unauthorized, "Missing bearer token")),
        }
    }
}

//
// GET /userinfo: scope-projected profile claims.
//
#[get("/userinfo")]
async fn userinfo(bearer: Option<AccessBearer>, conn: DbConn) -> Result<Json<Value>, OAuthErrorResponse> {
    let Some(bearer) = bearer else {
        return Err(OAuthErrorResponse::bearer(OAuthError::new(OAuthErrorKind::InvalidRequest, "Missing bearer token")));
    };

    let claims = match oauth::validate_access(&bearer.0, &conn).await {
        Ok(claims) => claims,
        Err(e) => return Err(OAuthErrorResponse::bearer(e)),
    };

    // Ban enforcement freshness: an already-issued token stops working the
    // moment its user is banned.
    match User::is_banned_fresh(claims.user_id, &conn).await {
        Some(false) => {}
        Some(true) => {
            return Err(OAuthErrorResponse::bearer(OAuthError::new(OAuthErrorKind::AccessDenied, "User is banned")));
        }
        None => {
            return Err(OAuthErrorResponse::bearer(OAuthError::new(
                OAuthErrorKind::InvalidGrant,
                "User no longer exists",
            )));
        }
    }

    let user = match USER_CACHE.get_or_load(claims.user_id, || User::find_by_id(claims.user_id, &conn)).await {
        Some(user) => user,
        None => {
            return Err(OAuthErrorResponse::bearer(OAuthError::new(
                OAuthErrorKind::InvalidGrant,
                "User no longer exists",
            )));
        }
    };

    let mut payload = json!({});
    if oauth::scope_has(&claims.scope, "openid") {
        payload["sub"] = json!(user.id.to_string());
    }
    if oauth::scope_has(&claims.scope, "profile") {
        payload["username"] = json!(user.username);
        payload["avatar_url"] = json!(user.resolved_avatar());
    }
    if oauth::scope_has(&claims.scope, "email") {
        payload["email"] = json!(user.email);
    }

    Ok(Json(payload))
}

#[derive(FromForm)]
struct RevokeForm {
    token: String,
}

//
// POST /revoke: RFC 7009. Always 200, nothing to probe.
//
#[post("/revoke", data = "<data>")]
async fn revoke(data: Form<RevokeForm>, conn: DbConn) -> Json<Value> {
    oauth::revoke(&data.into_inner().token, &conn).await;
    Json(json!({}))
}

//
// Authorized-applications surface for the account UI (native envelope).
//
#[get("/grants")]
async fn list_grants(headers: Headers, conn: DbConn) -> JsonResult {
    let grants = OauthGrant::find_by_user(headers.user.id, &conn).await;

    let mut entries = Vec::with_capacity(grants.len());
    for grant in grants {
        let name = OauthClient::find_by_id(&grant.client_id, &conn).await.map(|c| c.name);
        let mut entry = grant.to_json();
        entry["clientName"] = json!(name);
        entries.push(entry);
    }

    Ok(api_success(json!(entries)))
}

#[delete("/grants/<client_id>")]
async fn delete_grant(client_id: OauthClientId, headers: Headers, conn: DbConn) -> JsonResult {
    oauth::revoke_user_client(headers.user.id, &client_id, &conn).await?;

    UserLog::log(headers.user.id, "oauth-revoke-grant", json!({"clientId": client_id}), &conn).await;

    Ok(api_ok())
}

fn urlencode(value: &str) -> String {
    percent_encoding::percent_encode(value.as_bytes(), percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("https://app.example/cb"), "https%3A%2F%2Fapp%2Eexample%2Fcb");
        assert_eq!(urlencode("openid profile"), "openid%20profile");
    }
}
