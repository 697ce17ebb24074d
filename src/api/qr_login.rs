//
// Cross-device QR login
//
// The desktop generates a token, renders it as a QR code and subscribes to
// its status over the WebSocket fanout. The phone advances the state;
// every advance is pushed to the desktop.
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::Route;

use crate::{
    api::{api_ok, api_success, JsonResult, WS_QR_SUBSCRIBERS},
    auth::{self, Headers},
    db::models::{QrLoginToken, UserLog},
    db::DbConn,
};

pub fn routes() -> Vec<Route> {
    routes![generate, scan, mobile_confirm, mobile_cancel, cancel, set_session]
}

#[derive(Deserialize)]
struct QrTokenData {
    token: String,
}

/// Desktop: create a QR session. The browser then opens the WebSocket
/// subscription for this token.
#[post("/generate")]
async fn generate(conn: DbConn) -> JsonResult {
    let row = QrLoginToken::generate(&conn).await?;

    Ok(api_success(json!({
        "token": row.token,
        "expiresAt": crate::util::format_naive_datetime(&row.expires_at),
    })))
}

/// Phone: anonymous scan announcement. pending -> scanned.
#[post("/scan", data = "<data>")]
async fn scan(data: Json<QrTokenData>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    QrLoginToken::scan(&data.token, &conn).await?;

    WS_QR_SUBSCRIBERS.notify(&data.token, "scanned", None).await;
    Ok(api_ok())
}

/// Phone: authenticated confirmation. scanned -> confirmed; the desktop
/// receives a session bearer minted for the confirming user.
#[post("/mobile-confirm", data = "<data>")]
async fn mobile_confirm(data: Json<QrTokenData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let session_token = auth::mint_session(headers.user.id);
    QrLoginToken::confirm(&data.token, headers.user.id, &session_token, &conn).await?;

    UserLog::log(headers.user.id, "qr-login-confirm", json!({}), &conn).await;

    WS_QR_SUBSCRIBERS
        .notify(&data.token, "confirmed", Some(json!({"sessionToken": session_token})))
        .await;
    Ok(api_ok())
}

/// Phone: decline. scanned -> cancelled.
#[post("/mobile-cancel", data = "<data>")]
async fn mobile_cancel(data: Json<QrTokenData>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    QrLoginToken::cancel(&data.token, &conn).await?;

    WS_QR_SUBSCRIBERS.notify(&data.token, "cancelled", None).await;
    Ok(api_ok())
}

/// Desktop: dialog closed; any non-terminal token is deleted.
#[post("/cancel", data = "<data>")]
async fn cancel(data: Json<QrTokenData>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    QrLoginToken::delete_non_terminal(&data.token, &conn).await?;
    Ok(api_ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetSessionData {
    token: String,
    session_token: String,
}

/// Desktop: materialize the pushed session bearer as the `token` cookie.
/// The bearer must be the one bound to a confirmed QR token, so the desktop
/// can never obtain a session for anyone but the confirming user.
#[post("/set-session", data = "<data>")]
async fn set_session(data: Json<SetSessionData>, jar: &rocket::http::CookieJar<'_>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let row = match QrLoginToken::find(&data.token, &conn).await {
        Some(row) => row,
        None => err_code!("Unknown QR login token", "INVALID_TOKEN", 400),
    };

    let now = Utc::now().naive_utc();
    if row.is_expired(&now) {
        err_code!("QR login token expired", "TOKEN_EXPIRED", 400);
    }

    match row.session_token {
        Some(ref session_token) if crate::crypto::ct_eq(session_token, &data.session_token) => {}
        _ => err_code!("Session bearer does not match this QR login", "INVALID_TOKEN", 400),
    }

    // One-shot: the row served its purpose.
    row.delete(&conn).await.ok();

    auth::set_session_cookie(jar, data.session_token);
    Ok(api_ok())
}
