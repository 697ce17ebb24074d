//
// Microsoft federation reconciler
//
// Maps an external (Microsoft) identity onto a local user: direct login for
// already-linked accounts, an explicit link action for a signed-in user, and
// a pending-link confirmation handshake when only the email matches. Avatar
// bytes are reconciled by content hash, asynchronously, never blocking a
// login.
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;

use moka::sync::Cache;
use openidconnect::core::{
    CoreAuthDisplay, CoreAuthPrompt, CoreClient, CoreErrorResponseType, CoreGenderClaim,
    CoreJsonWebKey, CoreJweContentEncryptionAlgorithm, CoreProviderMetadata, CoreResponseType, CoreRevocableToken,
    CoreRevocationErrorResponse, CoreTokenIntrospectionResponse, CoreTokenResponse,
};
use openidconnect::{
    AuthenticationFlow, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EmptyAdditionalClaims, EndpointNotSet,
    EndpointSet, IssuerUrl, Nonce, OAuth2TokenResponse, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    StandardErrorResponse,
};

use crate::{
    api::{ApiResult, EmptyResult},
    cache::USER_CACHE,
    crypto,
    db::{
        models::{User, UserId},
        DbConn,
    },
    error::Error,
    storage, CONFIG,
};

const STATE_TTL: Duration = Duration::from_secs(10 * 60);
const PENDING_LINK_TTL: Duration = Duration::from_secs(10 * 60);
const AVATAR_SYNC_DEADLINE: Duration = Duration::from_secs(30);

const GRAPH_PHOTO_URL: &str = "https://graph.microsoft.com/v1.0/me/photo/$value";

/// OpenID Connect Core client, with the endpoints discovery fills in.
pub type CustomClient = openidconnect::Client<
    EmptyAdditionalClaims,
    CoreAuthDisplay,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJsonWebKey,
    CoreAuthPrompt,
    StandardErrorResponse<CoreErrorResponseType>,
    CoreTokenResponse,
    CoreTokenIntrospectionResponse,
    CoreRevocableToken,
    CoreRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
    EndpointSet,
>;

#[derive(Clone)]
pub struct Client {
    pub http_client: reqwest::Client,
    pub core_client: CustomClient,
}

static CLIENT_CACHE_KEY: Lazy<String> = Lazy::new(|| "sso-client".to_string());
static CLIENT_CACHE: Lazy<Cache<String, Client>> = Lazy::new(|| {
    Cache::builder().max_capacity(1).time_to_live(Duration::from_secs(CONFIG.sso_client_cache_expiration)).build()
});

/// What the browser is in the middle of, keyed by the OAuth `state`.
#[derive(Clone)]
struct SsoState {
    nonce: String,
    pkce_verifier: String,
    action: SsoAction,
    /// Set for `Link`: the signed-in user who asked to link.
    user_id: Option<UserId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SsoAction {
    Login,
    Link,
}

static STATE_CACHE: Lazy<Cache<String, SsoState>> =
    Lazy::new(|| Cache::builder().max_capacity(10_000).time_to_live(STATE_TTL).build());

/// A pending link-by-email handshake, keyed by its opaque token. Popped
/// atomically on confirmation.
#[derive(Clone)]
pub struct PendingLink {
    pub user_id: UserId,
    pub microsoft_id: String,
    pub display_name: String,
    pub email: String,
    pub avatar_bytes: Vec<u8>,
    pub issued_at: i64,
}

static PENDING_LINK_CACHE: Lazy<Cache<String, PendingLink>> =
    Lazy::new(|| Cache::builder().max_capacity(10_000).time_to_live(PENDING_LINK_TTL).build());

/// The external identity as handed to the reconciler.
pub struct ExternalIdentity {
    pub microsoft_id: String,
    pub display_name: String,
    pub email: String,
    pub avatar_bytes: Vec<u8>,
}

/// What the callback handler should do next.
pub enum SsoOutcome {
    /// Issue a session for this user and send the browser home.
    LoggedIn(UserId),
    /// The link action completed for this user.
    Linked(UserId),
    /// Send the browser to the confirmation page carrying this token.
    PendingLink(String),
}

impl Client {
    // Call the OpenId discovery endpoint to retrieve configuration
    async fn _get_client() -> ApiResult<Self> {
        let (Some(client_id), Some(client_secret)) =
            (CONFIG.microsoft_client_id.as_ref(), CONFIG.microsoft_client_secret.as_ref())
        else {
            err_code!("Microsoft sign-in is not configured", "NOT_LINKED", 404);
        };

        let client_id = ClientId::new(client_id.clone());
        let client_secret = ClientSecret::new(client_secret.clone());

        let issuer_url = match IssuerUrl::new(format!(
            "https://login.microsoftonline.com/{}/v2.0",
            CONFIG.microsoft_tenant
        )) {
            Ok(url) => url,
            Err(err) => err!(format!("Invalid issuer URL: {err}")),
        };

        let http_client = match crate::http_client::get_reqwest_client_builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(err) => err!(format!("Failed to build http client: {err}")),
        };

        let provider_metadata = match CoreProviderMetadata::discover_async(issuer_url, &http_client).await {
            Ok(metadata) => metadata,
            Err(err) => err!(format!("Failed to discover OpenID provider: {err}")),
        };

        let base_client = CoreClient::from_provider_metadata(provider_metadata, client_id, Some(client_secret));

        let token_uri = match base_client.token_uri() {
            Some(uri) => uri.clone(),
            None => err!("Failed to discover token endpoint, cannot proceed"),
        };

        let user_info_url = match base_client.user_info_url() {
            Some(url) => url.clone(),
            None => err!("Failed to discover user_info endpoint, cannot proceed"),
        };

        let redirect_url = match RedirectUrl::new(format!("{}/sso/microsoft/callback", CONFIG.domain)) {
            Ok(url) => url,
            Err(err) => err!(format!("Invalid redirect URL: {err}")),
        };

        let core_client = base_client
            .set_redirect_uri(redirect_url)
            .set_token_uri(token_uri)
            .set_user_info_url(user_info_url);

        Ok(Client {
            http_client,
            core_client,
        })
    }

    // Simple cache to prevent recalling the discovery endpoint each time
    pub async fn cached() -> ApiResult<Self> {
        if CONFIG.sso_client_cache_expiration > 0 {
            match CLIENT_CACHE.get(&*CLIENT_CACHE_KEY) {
                Some(client) => Ok(client),
                None => Self::_get_client().await.inspect(|client| {
                    debug!("Inserting new SSO client in cache");
                    CLIENT_CACHE.insert(CLIENT_CACHE_KEY.clone(), client.clone());
                }),
            }
        } else {
            Self::_get_client().await
        }
    }

    pub fn invalidate() {
        if CONFIG.sso_client_cache_expiration > 0 {
            CLIENT_CACHE.invalidate(&*CLIENT_CACHE_KEY);
        }
    }
}

/// Builds the Microsoft authorize URL and parks the browser state.
pub async fn authorize_url(action: SsoAction, user_id: Option<UserId>) -> ApiResult<url::Url> {
    let client = Client::cached().await?;

    let state = crypto::generate_token::<16>();
    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let state_for_csrf = state.clone();
    let (auth_url, _, nonce) = client
        .core_client
        .authorize_url(
            AuthenticationFlow::<CoreResponseType>::AuthorizationCode,
            || CsrfToken::new(state_for_csrf),
            Nonce::new_random,
        )
        .add_scope(Scope::new("profile".to_string()))
        .add_scope(Scope::new("email".to_string()))
        .add_scope(Scope::new("User.Read".to_string()))
        .set_pkce_challenge(pkce_challenge)
        .url();

    STATE_CACHE.insert(
        state,
        SsoState {
            nonce: nonce.secret().clone(),
            pkce_verifier: pkce_verifier.into_secret(),
            action,
            user_id,
        },
    );

    Ok(auth_url)
}

/// Exchanges the callback code, verifies the id token and assembles the
/// external identity, avatar bytes included.
async fn fetch_identity(code: &str, state: &SsoState) -> ApiResult<ExternalIdentity> {
    let client = Client::cached().await?;

    let exchange = client
        .core_client
        .exchange_code(AuthorizationCode::new(code.to_string()))
        .set_pkce_verifier(PkceCodeVerifier::new(state.pkce_verifier.clone()));

    let token_response = match exchange.request_async(&client.http_client).await {
        Ok(token_response) => token_response,
        Err(err) => {
            Client::invalidate();
            err!(format!("Failed to contact the Microsoft token endpoint: {err:?}"));
        }
    };

    let id_token = match token_response.extra_fields().id_token() {
        Some(token) => token,
        None => err!("Token response did not contain an id_token"),
    };

    let oidc_nonce = Nonce::new(state.nonce.clone());
    let claims = match id_token.claims(&client.core_client.id_token_verifier(), &oidc_nonce) {
        Ok(claims) => claims.clone(),
        Err(err) => {
            Client::invalidate();
            err!(format!("Could not read id_token claims: {err}"));
        }
    };

    let email = match claims.email() {
        Some(email) => crate::util::normalize_email(email.as_str()),
        None => err!("Microsoft identity carries no email address"),
    };

    let display_name = claims
        .name()
        .and_then(|name| name.get(None))
        .map(|name| name.as_str().to_string())
        .or_else(|| claims.preferred_username().map(|name| name.as_str().to_string()))
        .unwrap_or_else(|| email.clone());

    let avatar_bytes = fetch_avatar(token_response.access_token().secret()).await;

    Ok(ExternalIdentity {
        microsoft_id: claims.subject().as_str().to_string(),
        display_name,
        email,
        avatar_bytes,
    })
}

/// Graph photo fetch. Absence (404) and errors both come back as empty
/// bytes; avatar reconciliation treats that as "no avatar".
async fn fetch_avatar(access_token: &str) -> Vec<u8> {
    let request = match crate::http_client::make_http_request(reqwest::Method::GET, GRAPH_PHOTO_URL) {
        Ok(request) => request,
        Err(_) => return Vec::new(),
    };

    match request.bearer_auth(access_token).send().await {
        Ok(response) if response.status().is_success() => {
            response.bytes().await.map(|b| b.to_vec()).unwrap_or_default()
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            warn!("Failed to fetch Microsoft avatar: {e}");
            Vec::new()
        }
    }
}

/// The callback entry point: pops the browser state and drives the
/// reconciliation state machine.
pub async fn callback(state: &str, code: &str, conn: &DbConn) -> ApiResult<SsoOutcome> {
    let sso_state = match STATE_CACHE.remove(state) {
        Some(sso_state) => sso_state,
        None => err_code!("Unknown or expired sign-in attempt", "INVALID_TOKEN", 400),
    };

    let identity = fetch_identity(code, &sso_state).await?;
    reconcile(sso_state.action, sso_state.user_id, identity, conn).await
}

/// The state machine of §link/login. `current_user` is only set for the
/// link action.
async fn reconcile(
    action: SsoAction,
    current_user: Option<UserId>,
    identity: ExternalIdentity,
    conn: &DbConn,
) -> ApiResult<SsoOutcome> {
    let bound = User::find_by_microsoft_id(&identity.microsoft_id, conn).await;

    match (action, bound) {
        // Already bound to someone.
        (SsoAction::Login, Some(user)) => {
            let now = Utc::now().naive_utc();
            if user.is_banned(&now) {
                err_code!("This account is banned", "ACCESS_DENIED", 403);
            }
            let user_id = user.id;
            refresh_federation_facet(user, &identity, conn).await?;
            Ok(SsoOutcome::LoggedIn(user_id))
        }
        (SsoAction::Link, Some(user)) => {
            let Some(current) = current_user else {
                err_code!("Not signed in", "UNAUTHORIZED", 401);
            };
            if user.id != current {
                err_code!("This Microsoft account is linked to another user", "MICROSOFT_ALREADY_LINKED", 409);
            }
            // Idempotent refresh of the existing link.
            let user_id = user.id;
            refresh_federation_facet(user, &identity, conn).await?;
            Ok(SsoOutcome::Linked(user_id))
        }
        // Unbound external identity.
        (SsoAction::Login, None) => {
            match User::find_by_email(&identity.email, conn).await {
                Some(user) if !user.has_federation() => {
                    // Never auto-bind; the local user must confirm.
                    let token = crypto::generate_token::<32>();
                    PENDING_LINK_CACHE.insert(
                        token.clone(),
                        PendingLink {
                            user_id: user.id,
                            microsoft_id: identity.microsoft_id,
                            display_name: identity.display_name,
                            email: identity.email,
                            avatar_bytes: identity.avatar_bytes,
                            issued_at: Utc::now().timestamp(),
                        },
                    );
                    Ok(SsoOutcome::PendingLink(token))
                }
                // A user whose facet points at a different external id, or
                // no user at all: never auto-provision.
                _ => err_code!("No account is linked to this Microsoft identity", "NOT_LINKED", 404),
            }
        }
        (SsoAction::Link, None) => {
            let Some(current) = current_user else {
                err_code!("Not signed in", "UNAUTHORIZED", 401);
            };
            let mut user = match User::find_by_id(current, conn).await {
                Some(user) => user,
                None => err_code!("User not found", "USER_NOT_FOUND", 404),
            };
            let ExternalIdentity {
                microsoft_id,
                display_name,
                avatar_bytes,
                ..
            } = identity;
            user.set_federation(microsoft_id, display_name);
            user.save(conn).await?;
            USER_CACHE.invalidate(user.id);
            spawn_avatar_sync(user.id, avatar_bytes);
            Ok(SsoOutcome::Linked(user.id))
        }
    }
}

/// Keeps the stored display name current and hands the avatar bytes to the
/// async reconciler.
async fn refresh_federation_facet(mut user: User, identity: &ExternalIdentity, conn: &DbConn) -> EmptyResult {
    if user.microsoft_name.as_deref() != Some(&identity.display_name) {
        user.microsoft_name = Some(identity.display_name.clone());
        user.save(conn).await?;
        USER_CACHE.invalidate(user.id);
    }
    spawn_avatar_sync(user.id, identity.avatar_bytes.clone());
    Ok(())
}

/// Peek at a pending link for the confirmation page. Does not consume.
pub fn pending_link(token: &str) -> Option<PendingLink> {
    PENDING_LINK_CACHE.get(token)
}

/// Confirms a pending link: pops the handshake token atomically, re-checks
/// that the external id is still unbound, binds and returns the user id.
/// A session, when present, must belong to the candidate.
pub async fn confirm_link(token: &str, session_user: Option<UserId>, conn: &DbConn) -> ApiResult<UserId> {
    let PendingLink {
        user_id,
        microsoft_id,
        display_name,
        email,
        avatar_bytes,
        issued_at,
    } = match PENDING_LINK_CACHE.remove(token) {
        Some(pending) => pending,
        None => err_code!("Unknown or expired link confirmation", "INVALID_TOKEN", 400),
    };

    if let Some(session_user) = session_user {
        if session_user != user_id {
            err_code!("Signed-in user does not match the pending link", "ACCESS_DENIED", 403);
        }
    }

    // Re-check that the external id is still unbound; a parallel link could
    // have won in the meantime.
    if User::find_by_microsoft_id(&microsoft_id, conn).await.is_some() {
        err_code!("This Microsoft account is linked to another user", "MICROSOFT_ALREADY_LINKED", 409);
    }

    let mut user = match User::find_by_id(user_id, conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    let now = Utc::now().naive_utc();
    if user.is_banned(&now) {
        err_code!("This account is banned", "ACCESS_DENIED", 403);
    }

    debug!("Confirming pending link for {email} issued at {issued_at}");

    user.set_federation(microsoft_id, display_name);
    user.save(conn).await?;
    USER_CACHE.invalidate(user.id);
    spawn_avatar_sync(user.id, avatar_bytes);

    Ok(user.id)
}

/// Clears the federation facet and asynchronously removes any stored
/// avatar artifact.
pub async fn unlink(user_id: UserId, conn: &DbConn) -> EmptyResult {
    let mut user = match User::find_by_id(user_id, conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    if !user.has_federation() {
        err_code!("No Microsoft account is linked", "NOT_LINKED", 404);
    }

    user.clear_federation();
    user.save(conn).await?;
    USER_CACHE.invalidate(user_id);

    tokio::spawn(async move {
        match tokio::time::timeout(AVATAR_SYNC_DEADLINE, storage::delete_avatar(user_id)).await {
            Ok(Err(e)) => warn!("Avatar artifact deletion for user {user_id} failed: {e:#?}"),
            Err(_) => warn!("Avatar artifact deletion for user {user_id} timed out"),
            Ok(Ok(())) => {}
        }
    });

    Ok(())
}

/// Fire-and-forget avatar reconciliation by content hash. Owns its own
/// deadline and database connection; never blocks a login response.
pub fn spawn_avatar_sync(user_id: UserId, avatar_bytes: Vec<u8>) {
    tokio::spawn(async move {
        let result = tokio::time::timeout(AVATAR_SYNC_DEADLINE, sync_avatar(user_id, avatar_bytes)).await;
        match result {
            Ok(Err(e)) => warn!("Avatar sync for user {user_id} failed: {e:#?}"),
            Err(_) => warn!("Avatar sync for user {user_id} timed out"),
            Ok(Ok(())) => {}
        }
    });
}

async fn sync_avatar(user_id: UserId, avatar_bytes: Vec<u8>) -> Result<(), Error> {
    let conn = crate::db::get_conn().await?;
    let mut user = match User::find_by_id(user_id, &conn).await {
        Some(user) => user,
        None => return Ok(()),
    };

    let stored_hash = user.microsoft_avatar_hash.clone().unwrap_or_default();

    if avatar_bytes.is_empty() {
        // Avatar removed upstream; clear our copy if we had one.
        if !stored_hash.is_empty() {
            user.microsoft_avatar_url = None;
            user.microsoft_avatar_hash = None;
            user.save(&conn).await?;
            USER_CACHE.invalidate(user_id);
            storage::delete_avatar(user_id).await.ok();
        }
        return Ok(());
    }

    let new_hash = crypto::sha256_hex(&avatar_bytes);
    if new_hash == stored_hash {
        return Ok(());
    }

    let avatar_url = storage::store_avatar(user_id, avatar_bytes).await?;

    user.microsoft_avatar_url = Some(avatar_url);
    user.microsoft_avatar_hash = Some(new_hash);
    user.save(&conn).await?;
    USER_CACHE.invalidate(user_id);

    Ok(())
}
