//
// Microsoft federation routes
//
// Browser-facing: the login/link kickoffs and the provider callback
// redirect; JSON: the pending-link preview, confirmation and unlink.
use rocket::http::CookieJar;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::Route;

use crate::{
    api::{api_ok, api_success, JsonResult},
    auth::{self, Headers},
    db::models::UserLog,
    db::DbConn,
    sso::{self, SsoAction, SsoOutcome},
    storage, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![microsoft_login, microsoft_link, microsoft_callback, pending_link, confirm_link, unlink]
}

/// Kick off a federated sign-in.
#[get("/microsoft/login")]
async fn microsoft_login() -> Result<Redirect, crate::error::Error> {
    let url = sso::authorize_url(SsoAction::Login, None).await?;
    Ok(Redirect::to(url.to_string()))
}

/// Kick off linking the signed-in account to a Microsoft identity.
#[get("/microsoft/link")]
async fn microsoft_link(headers: Headers) -> Result<Redirect, crate::error::Error> {
    let url = sso::authorize_url(SsoAction::Link, Some(headers.user.id)).await?;
    Ok(Redirect::to(url.to_string()))
}

/// The provider redirects the browser back here. Every outcome ends in a
/// redirect; errors land on the login page with an error code the
/// front-end can display.
#[get("/microsoft/callback?<code>&<state>&<error>")]
async fn microsoft_callback(
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    jar: &CookieJar<'_>,
    conn: DbConn,
) -> Redirect {
    if let Some(error) = error {
        warn!("Microsoft sign-in returned an error: {error}");
        return Redirect::to(format!("{}/login?error=ACCESS_DENIED", CONFIG.domain));
    }

    let (Some(code), Some(state)) = (code, state) else {
        return Redirect::to(format!("{}/login?error=INVALID_TOKEN", CONFIG.domain));
    };

    match sso::callback(&state, &code, &conn).await {
        Ok(SsoOutcome::LoggedIn(user_id)) => {
            UserLog::log(user_id, "login-microsoft", json!({}), &conn).await;
            auth::set_session_cookie(jar, auth::mint_session(user_id));
            Redirect::to(format!("{}/", CONFIG.domain))
        }
        Ok(SsoOutcome::Linked(user_id)) => {
            UserLog::log(user_id, "link-microsoft", json!({}), &conn).await;
            Redirect::to(format!("{}/account", CONFIG.domain))
        }
        Ok(SsoOutcome::PendingLink(token)) => {
            Redirect::to(format!("{}/account/link?token={}", CONFIG.domain, token))
        }
        Err(e) => {
            warn!("Microsoft callback failed: {}", e.message());
            Redirect::to(format!("{}/login?error={}", CONFIG.domain, e.error_code()))
        }
    }
}

/// Preview data for the link-confirmation page.
#[get("/pending-link?<token>")]
async fn pending_link(token: String, conn: DbConn) -> JsonResult {
    let pending = match sso::pending_link(&token) {
        Some(pending) => pending,
        None => err_code!("Unknown or expired link confirmation", "INVALID_TOKEN", 400),
    };

    let user = match crate::db::models::User::find_by_id(pending.user_id, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    let microsoft_avatar = if pending.avatar_bytes.is_empty() {
        String::new()
    } else {
        storage::data_url(&pending.avatar_bytes)
    };

    Ok(api_success(json!({
        "username": user.username,
        "userAvatar": user.resolved_avatar(),
        "microsoftName": pending.display_name,
        "microsoftAvatar": microsoft_avatar,
    })))
}

#[derive(Deserialize)]
struct ConfirmLinkData {
    token: String,
}

/// Confirms a pending link and signs the user in.
#[post("/confirm-link", data = "<data>")]
async fn confirm_link(
    data: Json<ConfirmLinkData>,
    session: Option<Headers>,
    jar: &CookieJar<'_>,
    conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let session_user = session.map(|headers| headers.user.id);

    let user_id = sso::confirm_link(&data.token, session_user, &conn).await?;

    UserLog::log(user_id, "link-microsoft", json!({"via": "pending-link"}), &conn).await;

    auth::set_session_cookie(jar, auth::mint_session(user_id));
    Ok(api_ok())
}

/// Removes the federation facet from the signed-in account.
#[post("/unlink")]
async fn unlink(headers: Headers, conn: DbConn) -> JsonResult {
    sso::unlink(headers.user.id, &conn).await?;

    UserLog::log(headers.user.id, "unlink-microsoft", json!({}), &conn).await;

    Ok(api_ok())
}
