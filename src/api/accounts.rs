//
// Account lifecycle: register, login, profile, password, deletion
//
use chrono::Utc;
use rocket::data::Capped;
use rocket::http::CookieJar;
use rocket::serde::json::Json;
use rocket::Route;

use crate::{
    api::{api_ok, api_success, JsonResult},
    auth::{self, ClientIp, Headers},
    cache::USER_CACHE,
    captcha,
    db::models::{CodeIntent, NewUser, OneShotToken, User, UserLog, VerificationCode},
    db::DbConn,
    mail, oauth, ratelimit, storage,
};

pub fn routes() -> Vec<Route> {
    routes![
        register_send_code,
        verify_link,
        verify_code,
        register,
        login,
        logout,
        me,
        password_send_reset,
        password_reset,
        password_change,
        change_username,
        upload_avatar,
        account_send_delete,
        account_delete,
    ]
}

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 128;

fn validate_username(username: &str) -> crate::api::EmptyResult {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        err_code!("Username must be between 3 and 32 characters", "INTERNAL_ERROR", 400);
    }
    if !username.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        err_code!("Username contains invalid characters", "INTERNAL_ERROR", 400);
    }
    Ok(())
}

fn validate_password(password: &str) -> crate::api::EmptyResult {
    let len = password.chars().count();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&len) {
        err_code!("Password must be between 8 and 128 characters", "INTERNAL_ERROR", 400);
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendCodeData {
    email: String,
    captcha_token: Option<String>,
}

/// Step 1 of registration: mail a one-shot verification link.
#[post("/register/send-code", data = "<data>")]
async fn register_send_code(data: Json<SendCodeData>, ip: ClientIp, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_register(&ip.ip)?;

    let data = data.into_inner();
    captcha::verify_captcha(data.captcha_token.as_deref(), &ip.ip).await?;

    let email = crate::util::normalize_email(&data.email);
    if !crate::util::is_valid_email(&email) {
        err_code!("Invalid email address", "INTERNAL_ERROR", 400);
    }

    if User::find_by_email(&email, &conn).await.is_some() {
        err_code!("This email is already registered", "EMAIL_EXISTS", 409);
    }

    let token = OneShotToken::issue(&email, CodeIntent::Register, &conn).await?;
    mail::send_verification_link(&email, CodeIntent::Register, &token.token).await?;

    Ok(api_success(json!({
        "expiresAt": crate::util::format_naive_datetime(&token.expires_at),
    })))
}

/// Step 2: the mailed link redeems into a short numeric code, shown in the
/// UI and typed back into the original page.
#[get("/verify-link?<token>")]
async fn verify_link(token: String, conn: DbConn) -> JsonResult {
    let redeemed = OneShotToken::redeem(&token, &conn).await?;

    Ok(api_success(json!({
        "code": redeemed.code,
        "email": redeemed.email,
        "intent": redeemed.intent.as_name(),
    })))
}

#[derive(Deserialize)]
struct VerifyCodeData {
    email: String,
    code: String,
    intent: Option<String>,
}

/// Step 3: check the typed code.
#[post("/verify-code", data = "<data>")]
async fn verify_code(data: Json<VerifyCodeData>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let expected_intent = match data.intent.as_deref() {
        Some(name) => match CodeIntent::from_name(name) {
            Some(intent) => Some(intent),
            None => err_code!("Unknown verification intent", "INTERNAL_ERROR", 400),
        },
        None => None,
    };

    let outcome = VerificationCode::verify(&data.code, &data.email, expected_intent, &conn).await?;

    Ok(api_success(json!({
        "intent": outcome.intent.as_name(),
        "alreadyVerified": outcome.already_verified,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterData {
    email: String,
    username: String,
    password: String,
    code: String,
}

/// Step 4: consume the verified code and create the user.
#[post("/register", data = "<data>")]
async fn register(data: Json<RegisterData>, ip: ClientIp, jar: &CookieJar<'_>, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_register(&ip.ip)?;

    let data = data.into_inner();
    let email = crate::util::normalize_email(&data.email);

    validate_username(&data.username)?;
    validate_password(&data.password)?;

    if User::find_by_email(&email, &conn).await.is_some() {
        err_code!("This email is already registered", "EMAIL_EXISTS", 409);
    }
    if User::find_by_username(&data.username, &conn).await.is_some() {
        err_code!("This username is already taken", "USERNAME_EXISTS", 409);
    }

    VerificationCode::consume(&data.code, &email, CodeIntent::Register, &conn).await?;

    let new_user = NewUser::new(data.username, email, &data.password)?;
    let user = User::create(new_user, &conn).await?;

    UserLog::log(user.id, "register", json!({"ip": ip.ip.to_string()}), &conn).await;

    auth::set_session_cookie(jar, auth::mint_session(user.id));
    Ok(api_success(user.to_json()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    email: String,
    password: String,
    captcha_token: Option<String>,
}

#[post("/login", data = "<data>")]
async fn login(data: Json<LoginData>, ip: ClientIp, jar: &CookieJar<'_>, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_login(&ip.ip)?;

    let data = data.into_inner();
    captcha::verify_captcha(data.captcha_token.as_deref(), &ip.ip).await?;

    let user = match User::find_by_email(&data.email, &conn).await {
        Some(user) => user,
        None => err_code!(
            "Email or password is incorrect",
            format!("Failed login for {} from {}", data.email, ip.ip),
            "UNAUTHORIZED",
            401
        ),
    };

    if !user.check_valid_password(&data.password) {
        err_code!(
            "Email or password is incorrect",
            format!("Failed login for {} from {}", data.email, ip.ip),
            "UNAUTHORIZED",
            401
        );
    }

    let now = Utc::now().naive_utc();
    if user.is_banned(&now) {
        err_code!("This account is banned", "ACCESS_DENIED", 403);
    }

    UserLog::log(user.id, "login", json!({"ip": ip.ip.to_string()}), &conn).await;

    auth::set_session_cookie(jar, auth::mint_session(user.id));
    Ok(api_success(user.to_json()))
}

#[post("/logout")]
fn logout(jar: &CookieJar<'_>) -> JsonResult {
    auth::clear_session_cookie(jar);
    Ok(api_ok())
}

#[get("/me")]
fn me(headers: Headers) -> JsonResult {
    Ok(api_success(headers.user.to_json()))
}

#[derive(Deserialize)]
struct SendResetData {
    email: String,
}

/// Mails a reset link. Answers identically for unknown addresses so the
/// endpoint cannot be used to probe registrations.
#[post("/password/send-reset", data = "<data>")]
async fn password_send_reset(data: Json<SendResetData>, ip: ClientIp, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_reset(&ip.ip)?;

    let data = data.into_inner();
    let email = crate::util::normalize_email(&data.email);

    if User::find_by_email(&email, &conn).await.is_some() {
        let token = OneShotToken::issue(&email, CodeIntent::Reset, &conn).await?;
        if let Err(e) = mail::send_verification_link(&email, CodeIntent::Reset, &token.token).await {
            if e.error_code() == "EMAIL_DISABLED" {
                return Err(e);
            }
            error!("Failed to send reset email: {e:#?}");
        }
    }

    Ok(api_ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordData {
    email: String,
    code: String,
    new_password: String,
}

#[post("/password/reset", data = "<data>")]
async fn password_reset(data: Json<ResetPasswordData>, ip: ClientIp, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_reset(&ip.ip)?;

    let data = data.into_inner();
    let email = crate::util::normalize_email(&data.email);
    validate_password(&data.new_password)?;

    let mut user = match User::find_by_email(&email, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    VerificationCode::consume(&data.code, &email, CodeIntent::Reset, &conn).await?;

    user.set_password(&data.new_password)?;
    user.save(&conn).await?;

    // Kill any other outstanding codes for this mailbox.
    VerificationCode::invalidate_by_email(&email, None, &conn).await?;
    USER_CACHE.invalidate(user.id);

    UserLog::log(user.id, "reset-password", json!({"ip": ip.ip.to_string()}), &conn).await;
    mail::send_password_changed(&email).await.ok();

    Ok(api_ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordData {
    current_password: String,
    new_password: String,
}

#[post("/password/change", data = "<data>")]
async fn password_change(data: Json<ChangePasswordData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let ip = headers.ip;
    let mut user = headers.user;

    if !user.check_valid_password(&data.current_password) {
        err_code!("Current password is incorrect", "UNAUTHORIZED", 401);
    }
    validate_password(&data.new_password)?;

    user.set_password(&data.new_password)?;
    user.save(&conn).await?;

    // Outstanding reset codes die with the old password.
    VerificationCode::invalidate_by_email(&user.email, Some(CodeIntent::Reset), &conn).await?;
    USER_CACHE.invalidate(user.id);

    UserLog::log(user.id, "change-password", json!({"ip": ip.to_string()}), &conn).await;
    mail::send_password_changed(&user.email).await.ok();

    Ok(api_ok())
}

#[derive(Deserialize)]
struct ChangeUsernameData {
    username: String,
}

#[post("/username", data = "<data>")]
async fn change_username(data: Json<ChangeUsernameData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    validate_username(&data.username)?;

    if data.username == user.username {
        return Ok(api_success(user.to_json()));
    }

    if User::find_by_username(&data.username, &conn).await.is_some() {
        err_code!("This username is already taken", "USERNAME_EXISTS", 409);
    }

    let old_username = std::mem::replace(&mut user.username, data.username);
    user.save(&conn).await?;
    USER_CACHE.invalidate(user.id);

    UserLog::log(user.id, "change-username", json!({"from": old_username, "to": user.username}), &conn).await;

    Ok(api_success(user.to_json()))
}

/// Raw image upload, capped by the `bytes` limit (5 MB). Oversized bodies
/// are cut off by Rocket before the handler sees them.
#[post("/avatar", data = "<data>")]
async fn upload_avatar(data: Capped<Vec<u8>>, headers: Headers, conn: DbConn) -> JsonResult {
    if !data.is_complete() {
        err_code!("Avatar exceeds the size limit", "REQUEST_TOO_LARGE", 413);
    }

    let bytes = data.into_inner();
    if bytes.is_empty() {
        err_code!("Avatar upload is empty", "INTERNAL_ERROR", 400);
    }

    let mut user = headers.user;
    let avatar_url = storage::store_avatar(user.id, bytes).await?;

    user.avatar = avatar_url.clone();
    user.save(&conn).await?;
    USER_CACHE.invalidate(user.id);

    UserLog::log(user.id, "change-avatar", json!({}), &conn).await;

    Ok(api_success(json!({"avatarUrl": avatar_url})))
}

/// Account deletion is gated behind a delete-intent verification code.
#[post("/account/send-delete")]
async fn account_send_delete(headers: Headers, conn: DbConn) -> JsonResult {
    let token = OneShotToken::issue(&headers.user.email, CodeIntent::DeleteAccount, &conn).await?;
    mail::send_verification_link(&headers.user.email, CodeIntent::DeleteAccount, &token.token).await?;

    Ok(api_success(json!({
        "expiresAt": crate::util::format_naive_datetime(&token.expires_at),
    })))
}

#[derive(Deserialize)]
struct DeleteAccountData {
    code: String,
}

#[post("/account/delete", data = "<data>")]
async fn account_delete(data: Json<DeleteAccountData>, headers: Headers, jar: &CookieJar<'_>, conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let user = headers.user;

    VerificationCode::consume(&data.code, &user.email, CodeIntent::DeleteAccount, &conn).await?;

    let user_id = user.id;
    let email = user.email.clone();

    oauth::revoke_user(user_id, &conn).await?;
    user.delete(&conn).await?;
    USER_CACHE.invalidate(user_id);

    mail::send_account_deleted(&email).await.ok();
    auth::clear_session_cookie(jar);

    Ok(api_ok())
}
