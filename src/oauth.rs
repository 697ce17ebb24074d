//
// OAuth 2.0 engine
//
// Client registry checks, authorization-code lifecycle, token-pair minting
// and rotation, validation and cascaded revocation. Everything here returns
// typed OAuth errors; the request facade in `api::oauth` turns them into
// the RFC 6749 JSON envelope.
use chrono::{Duration, Utc};

use crate::crypto;
use crate::db::models::{
    AccessToken, AuthorizationCode, OauthClient, OauthClientId, OauthGrant, RefreshToken, User, UserId,
};
use crate::db::DbConn;

pub const AUTH_CODE_TTL_SECS: i64 = 600;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 2_592_000;

/// The closed scope vocabulary. Unknown components are silently dropped
/// during normalization; an empty normalized set is invalid.
pub const SCOPE_VOCABULARY: &[&str] = &["openid", "profile", "email"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    ServerError,
}

impl OAuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorKind::InvalidRequest => "invalid_request",
            OAuthErrorKind::InvalidClient => "invalid_client",
            OAuthErrorKind::InvalidGrant => "invalid_grant",
            OAuthErrorKind::UnauthorizedClient => "unauthorized_client",
            OAuthErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorKind::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorKind::InvalidScope => "invalid_scope",
            OAuthErrorKind::AccessDenied => "access_denied",
            OAuthErrorKind::ServerError => "server_error",
        }
    }

    /// HTTP status per RFC 6749 §5.2 plus the access_denied and
    /// server_error conventions.
    pub fn status(&self) -> u16 {
        match self {
            OAuthErrorKind::InvalidClient => 401,
            OAuthErrorKind::AccessDenied => 403,
            OAuthErrorKind::ServerError => 500,
            _ => 400,
        }
    }
}

#[derive(Debug)]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub description: String,
}

impl OAuthError {
    pub fn new<D: Into<String>>(kind: OAuthErrorKind, description: D) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.description)
    }
}

pub type OAuthResult<T> = Result<T, OAuthError>;

macro_rules! oauth_err {
    ($kind:ident, $desc:expr) => {
        return Err(OAuthError::new(OAuthErrorKind::$kind, $desc))
    };
}

/// Space-splits the input, drops unknown and duplicate components and
/// re-joins in input order. `None` when nothing survives.
pub fn normalize_scope(input: &str) -> Option<String> {
    let mut seen: Vec<&str> = Vec::new();
    for component in input.split(' ') {
        if SCOPE_VOCABULARY.contains(&component) && !seen.contains(&component) {
            seen.push(component);
        }
    }

    if seen.is_empty() {
        None
    } else {
        Some(seen.join(" "))
    }
}

pub fn scope_has(scope: &str, component: &str) -> bool {
    scope.split(' ').any(|s| s == component)
}

/// The success payload of the token endpoint, serialized verbatim.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
}

/// Pre-consent client check for the authorize endpoint: existence and the
/// enabled flag only, no secret involved.
pub async fn validate_client_id(client_id: &str, conn: &DbConn) -> OAuthResult<OauthClient> {
    let id = OauthClientId::from(client_id);
    let client = match OauthClient::find_by_id(&id, conn).await {
        Some(client) => client,
        None => oauth_err!(InvalidClient, "Unknown client"),
    };

    if !client.enabled {
        oauth_err!(InvalidClient, "Client is disabled");
    }

    Ok(client)
}

/// Token-endpoint client authentication: id + secret.
pub async fn validate_client(client_id: &str, client_secret: &str, conn: &DbConn) -> OAuthResult<OauthClient> {
    let client = validate_client_id(client_id, conn).await?;

    if !client.check_valid_secret(client_secret) {
        oauth_err!(InvalidClient, "Invalid client secret");
    }

    Ok(client)
}

/// Banned users are rejected wherever the engine touches a user. The check
/// reads the authoritative store; banning separately triggers revoke_user.
async fn ensure_not_banned(user_id: UserId, conn: &DbConn) -> OAuthResult<()> {
    match User::is_banned_fresh(user_id, conn).await {
        Some(false) => Ok(()),
        Some(true) => oauth_err!(AccessDenied, "User is banned"),
        None => oauth_err!(AccessDenied, "User no longer exists"),
    }
}

/// Mints a single-use authorization code and, in the same logical step,
/// upserts the user-client grant with the approved scope set.
pub async fn issue_code(
    client: &OauthClient,
    user_id: UserId,
    redirect_uri: &str,
    scope: &str,
    conn: &DbConn,
) -> OAuthResult<String> {
    ensure_not_banned(user_id, conn).await?;

    let code = crypto::generate_token::<16>();
    let expires_at = Utc::now().naive_utc() + Duration::seconds(AUTH_CODE_TTL_SECS);

    let row = AuthorizationCode::new(
        code.clone(),
        client.client_id.clone(),
        user_id,
        redirect_uri.to_string(),
        scope.to_string(),
        expires_at,
    );

    if let Err(e) = row.insert(conn).await {
        error!("Failed to persist authorization code: {e:#?}");
        oauth_err!(ServerError, "Failed to persist authorization code");
    }

    if let Err(e) = OauthGrant::upsert(user_id, &client.client_id, scope, conn).await {
        error!("Failed to upsert grant: {e:#?}");
        oauth_err!(ServerError, "Failed to persist grant");
    }

    Ok(code)
}

/// Failure ladder: not-found, used, expired, client mismatch, redirect
/// mismatch. On success the code is consumed regardless of the token-pair
/// outcome.
pub async fn exchange_code(
    code: &str,
    client: &OauthClient,
    redirect_uri: &str,
    conn: &DbConn,
) -> OAuthResult<(TokenResponse, UserId)> {
    let row = match AuthorizationCode::find(code, conn).await {
        Some(row) => row,
        None => oauth_err!(InvalidGrant, "Unknown authorization code"),
    };

    if row.used {
        oauth_err!(InvalidGrant, "Authorization code already used");
    }

    if row.expires_at < Utc::now().naive_utc() {
        oauth_err!(InvalidGrant, "Authorization code expired");
    }

    if row.client_id != client.client_id {
        oauth_err!(InvalidGrant, "Authorization code was issued to another client");
    }

    // Exact byte-for-byte comparison against the URI stored at issue time.
    if row.redirect_uri != redirect_uri {
        oauth_err!(InvalidGrant, "redirect_uri does not match the authorization request");
    }

    ensure_not_banned(row.user_id, conn).await?;

    // Single-use: winning this guarded flip is the one permitted exchange.
    match AuthorizationCode::mark_used(code, conn).await {
        Ok(true) => {}
        Ok(false) => oauth_err!(InvalidGrant, "Authorization code already used"),
        Err(e) => {
            error!("Failed to mark authorization code used: {e:#?}");
            oauth_err!(ServerError, "Failed to consume authorization code");
        }
    }

    // If minting fails now, the code stays consumed; the caller sees
    // server_error and must start a new authorization.
    let tokens = mint_token_pair(&client.client_id, row.user_id, &row.scope, conn).await?;
    Ok((tokens, row.user_id))
}

/// Generates a fresh access + refresh pair and stores their SHA-256 hashes.
/// If the refresh row cannot be persisted the access row is rolled back.
pub async fn mint_token_pair(
    client_id: &OauthClientId,
    user_id: UserId,
    scope: &str,
    conn: &DbConn,
) -> OAuthResult<TokenResponse> {
    let now = Utc::now().naive_utc();

    let access_plain = crypto::generate_token::<32>();
    let refresh_plain = crypto::generate_token::<32>();
    let access_hash = crypto::sha256_hex(access_plain.as_bytes());
    let refresh_hash = crypto::sha256_hex(refresh_plain.as_bytes());

    let access_row = AccessToken {
        token_hash: access_hash.clone(),
        client_id: client_id.clone(),
        user_id,
        scope: scope.to_string(),
        created_at: now,
        expires_at: now + Duration::seconds(ACCESS_TOKEN_TTL_SECS),
    };

    if let Err(e) = access_row.insert(conn).await {
        error!("Failed to persist access token: {e:#?}");
        oauth_err!(ServerError, "Failed to persist access token");
    }

    let refresh_row = RefreshToken {
        token_hash: refresh_hash,
        access_token_hash: Some(access_hash.clone()),
        client_id: client_id.clone(),
        user_id,
        scope: scope.to_string(),
        created_at: now,
        expires_at: now + Duration::seconds(REFRESH_TOKEN_TTL_SECS),
    };

    if let Err(e) = refresh_row.insert(conn).await {
        error!("Failed to persist refresh token, rolling back access token: {e:#?}");
        AccessToken::delete_by_hash(&access_hash, conn).await.ok();
        oauth_err!(ServerError, "Failed to persist refresh token");
    }

    Ok(TokenResponse {
        access_token: access_plain,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL_SECS,
        refresh_token: refresh_plain,
        scope: scope.to_string(),
    })
}

/// Refresh-token rotation: the old refresh row and its paired access row
/// are deleted before a new pair is minted. The old refresh is single-use.
pub async fn refresh(
    refresh_plaintext: &str,
    client: &OauthClient,
    conn: &DbConn,
) -> OAuthResult<(TokenResponse, UserId)> {
    let hash = crypto::sha256_hex(refresh_plaintext.as_bytes());

    let row = match RefreshToken::find_by_hash(&hash, conn).await {
        Some(row) => row,
        None => oauth_err!(InvalidGrant, "Unknown refresh token"),
    };

    if row.expires_at < Utc::now().naive_utc() {
        oauth_err!(InvalidGrant, "Refresh token expired");
    }

    if row.client_id != client.client_id {
        oauth_err!(InvalidGrant, "Refresh token was issued to another client");
    }

    ensure_not_banned(row.user_id, conn).await?;

    if let Err(e) = RefreshToken::delete_by_hash(&hash, conn).await {
        error!("Failed to rotate refresh token: {e:#?}");
        oauth_err!(ServerError, "Failed to rotate refresh token");
    }
    if let Some(ref access_hash) = row.access_token_hash {
        AccessToken::delete_by_hash(access_hash, conn).await.ok();
    }

    let tokens = mint_token_pair(&client.client_id, row.user_id, &row.scope, conn).await?;
    Ok((tokens, row.user_id))
}

pub struct AccessClaims {
    pub user_id: UserId,
    pub client_id: OauthClientId,
    pub scope: String,
}

/// Hash lookup of a presented access token. No refresh-on-expire here.
pub async fn validate_access(plaintext: &str, conn: &DbConn) -> OAuthResult<AccessClaims> {
    let hash = crypto::sha256_hex(plaintext.as_bytes());

    let row = match AccessToken::find_by_hash(&hash, conn).await {
        Some(row) => row,
        None => oauth_err!(InvalidGrant, "Unknown access token"),
    };

    if row.expires_at < Utc::now().naive_utc() {
        oauth_err!(InvalidGrant, "Access token expired");
    }

    Ok(AccessClaims {
        user_id: row.user_id,
        client_id: row.client_id,
        scope: row.scope,
    })
}

/// RFC 7009: deletes whatever matches, reports nothing either way to
/// prevent token probing.
pub async fn revoke(plaintext: &str, conn: &DbConn) {
    let hash = crypto::sha256_hex(plaintext.as_bytes());
    AccessToken::delete_by_hash(&hash, conn).await.ok();
    RefreshToken::delete_by_hash(&hash, conn).await.ok();
}

/// "Remove authorized app": every token for the pair, then the grant.
pub async fn revoke_user_client(user_id: UserId, client_id: &OauthClientId, conn: &DbConn) -> crate::api::EmptyResult {
    AccessToken::delete_all_by_user_client(user_id, client_id, conn).await?;
    RefreshToken::delete_all_by_user_client(user_id, client_id, conn).await?;
    OauthGrant::delete(user_id, client_id, conn).await
}

/// Used on ban and account deletion.
pub async fn revoke_user(user_id: UserId, conn: &DbConn) -> crate::api::EmptyResult {
    AccessToken::delete_all_by_user(user_id, conn).await?;
    RefreshToken::delete_all_by_user(user_id, conn).await?;
    AuthorizationCode::delete_all_by_user(user_id, conn).await?;
    OauthGrant::delete_all_by_user(user_id, conn).await
}

/// Used on client disable and client deletion.
pub async fn revoke_client(client_id: &OauthClientId, conn: &DbConn) -> crate::api::EmptyResult {
    AccessToken::delete_all_by_client(client_id, conn).await?;
    RefreshToken::delete_all_by_client(client_id, conn).await?;
    AuthorizationCode::delete_all_by_client(client_id, conn).await?;
    OauthGrant::delete_all_by_client(client_id, conn).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scope_filters_unknown_components() {
        assert_eq!(normalize_scope("openid profile"), Some("openid profile".to_string()));
        assert_eq!(normalize_scope("openid wat profile"), Some("openid profile".to_string()));
        assert_eq!(normalize_scope("wat"), None);
        assert_eq!(normalize_scope(""), None);
    }

    #[test]
    fn test_normalize_scope_keeps_input_order_and_dedupes() {
        assert_eq!(normalize_scope("email openid email"), Some("email openid".to_string()));
        assert_eq!(normalize_scope("profile openid"), Some("profile openid".to_string()));
    }

    #[test]
    fn test_scope_has() {
        assert!(scope_has("openid profile", "profile"));
        assert!(!scope_has("openid profile", "email"));
        // No prefix confusion.
        assert!(!scope_has("openid", "open"));
    }

    #[test]
    fn test_error_kind_wire_codes() {
        assert_eq!(OAuthErrorKind::InvalidGrant.as_str(), "invalid_grant");
        assert_eq!(OAuthErrorKind::InvalidClient.status(), 401);
        assert_eq!(OAuthErrorKind::AccessDenied.status(), 403);
        assert_eq!(OAuthErrorKind::ServerError.status(), 500);
        assert_eq!(OAuthErrorKind::InvalidScope.status(), 400);
    }

    #[test]
    fn test_token_response_wire_shape() {
        let resp = TokenResponse {
            access_token: "at".into(),
            token_type: "Bearer",
            expires_in: ACCESS_TOKEN_TTL_SECS,
            refresh_token: "rt".into(),
            scope: "openid".into(),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["token_type"], "Bearer");
        assert_eq!(value["expires_in"], 3600);
        assert_eq!(value["access_token"], "at");
        assert_eq!(value["refresh_token"], "rt");
        assert_eq!(value["scope"], "openid");
    }

    #[test]
    fn test_lifetimes_are_not_negotiable() {
        assert_eq!(AUTH_CODE_TTL_SECS, 600);
        assert_eq!(ACCESS_TOKEN_TTL_SECS, 3600);
        assert_eq!(REFRESH_TOKEN_TTL_SECS, 2_592_000);
    }
}
