//
// Admin surface
//
// Role-gated management of users, bans, the OAuth client registry and the
// audit logs. Every state change writes an admin-log row; bans additionally
// trigger a full OAuth revocation for the target. The role gates answer
// 404, never 403.
use chrono::NaiveDateTime;
use rocket::serde::json::Json;
use rocket::Route;

use crate::{
    api::{api_ok, api_success, JsonResult},
    cache::USER_CACHE,
    db::models::{AdminLog, NewOauthClient, OauthClient, OauthClientId, User, UserId, UserLog, UserRole},
    db::DbConn,
    auth::{AdminHeaders, SuperAdminHeaders},
    oauth,
};

pub fn routes() -> Vec<Route> {
    routes![
        list_users,
        get_user,
        ban_user,
        unban_user,
        set_role,
        delete_user,
        list_clients,
        create_client,
        regenerate_client_secret,
        toggle_client,
        delete_client,
        admin_logs,
        user_logs,
        cache_stats,
    ]
}

const LOG_PAGE_SIZE: i64 = 200;

#[get("/users?<search>")]
async fn list_users(search: Option<String>, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let users = match search.as_deref() {
        Some(term) if !term.trim().is_empty() => User::search(term.trim(), &conn).await,
        _ => User::get_all(&conn).await,
    };

    let entries: Vec<_> = users.iter().map(User::to_admin_json).collect();
    Ok(api_success(json!(entries)))
}

#[get("/users/<user_id>")]
async fn get_user(user_id: UserId, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    match User::find_by_id(user_id, &conn).await {
        Some(user) => Ok(api_success(user.to_admin_json())),
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanData {
    reason: Option<String>,
    /// Absent means a permanent ban.
    unban_at: Option<NaiveDateTime>,
}

/// Banning revokes every OAuth artifact of the target. In-flight session
/// bearers die at the next request through the ban gate.
#[post("/users/<user_id>/ban", data = "<data>")]
async fn ban_user(user_id: UserId, data: Json<BanData>, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let mut user = match User::find_by_id(user_id, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    // Admins cannot ban their peers or betters.
    if user.role() >= headers.role {
        err_code!("Cannot ban a user of equal or higher role", "ACCESS_DENIED", 403);
    }

    user.set_ban(data.reason.clone(), headers.user.id, data.unban_at);
    user.save(&conn).await?;
    USER_CACHE.invalidate(user_id);

    oauth::revoke_user(user_id, &conn).await?;

    AdminLog::log(
        headers.user.id,
        "ban-user",
        Some(user_id),
        json!({
            "reason": data.reason,
            "unbanAt": data.unban_at.as_ref().map(crate::util::format_naive_datetime),
            "ip": headers.ip.to_string(),
        }),
        &conn,
    )
    .await;

    Ok(api_ok())
}

#[post("/users/<user_id>/unban")]
async fn unban_user(user_id: UserId, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let mut user = match User::find_by_id(user_id, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    user.clear_ban();
    user.save(&conn).await?;
    USER_CACHE.invalidate(user_id);

    AdminLog::log(headers.user.id, "unban-user", Some(user_id), json!({}), &conn).await;

    Ok(api_ok())
}

#[derive(Deserialize)]
struct RoleData {
    role: String,
}

/// Role changes take a super-admin.
#[post("/users/<user_id>/role", data = "<data>")]
async fn set_role(user_id: UserId, data: Json<RoleData>, headers: SuperAdminHeaders, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let role = match data.role.as_str() {
        "regular" => UserRole::Regular,
        "admin" => UserRole::Admin,
        "super-admin" => UserRole::SuperAdmin,
        _ => err_code!("Unknown role", "INTERNAL_ERROR", 400),
    };

    let mut user = match User::find_by_id(user_id, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    if user.id == headers.user.id {
        err_code!("Cannot change your own role", "ACCESS_DENIED", 403);
    }

    user.role = role as i32;
    user.save(&conn).await?;
    USER_CACHE.invalidate(user_id);

    AdminLog::log(
        headers.user.id,
        "set-role",
        Some(user_id),
        json!({"role": role.as_str(), "ip": headers.ip.to_string()}),
        &conn,
    )
    .await;

    Ok(api_ok())
}

#[delete("/users/<user_id>")]
async fn delete_user(user_id: UserId, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let user = match User::find_by_id(user_id, &conn).await {
        Some(user) => user,
        None => err_code!("User not found", "USER_NOT_FOUND", 404),
    };

    if user.role() >= headers.role {
        err_code!("Cannot delete a user of equal or higher role", "ACCESS_DENIED", 403);
    }

    let email = user.email.clone();
    oauth::revoke_user(user_id, &conn).await?;
    user.delete(&conn).await?;
    USER_CACHE.invalidate(user_id);

    AdminLog::log(headers.user.id, "delete-user", Some(user_id), json!({"email": email}), &conn).await;

    Ok(api_ok())
}

//
// OAuth client registry
//

#[get("/clients")]
async fn list_clients(_headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let clients = OauthClient::get_all(&conn).await;
    let entries: Vec<_> = clients.iter().map(OauthClient::to_json).collect();
    Ok(api_success(json!(entries)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateClientData {
    name: String,
    description: Option<String>,
    redirect_uri: String,
}

/// The client secret appears once, in this response, and never again.
#[post("/clients", data = "<data>")]
async fn create_client(data: Json<CreateClientData>, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    if data.name.trim().is_empty() {
        err_code!("Client name cannot be empty", "INTERNAL_ERROR", 400);
    }

    match url::Url::parse(&data.redirect_uri) {
        Ok(url) if url.scheme() == "https" || url.scheme() == "http" => {}
        _ => err_code!("redirect_uri must be an absolute http(s) URL", "INTERNAL_ERROR", 400),
    }

    let NewOauthClient {
        mut client,
        plaintext_secret,
    } = OauthClient::new(data.name, data.description.unwrap_or_default(), data.redirect_uri)?;
    client.save(&conn).await?;

    AdminLog::log(headers.user.id, "create-client", None, json!({"clientId": client.client_id}), &conn).await;

    let mut entry = client.to_json();
    entry["clientSecret"] = json!(plaintext_secret);
    Ok(api_success(entry))
}

#[post("/clients/<client_id>/regenerate-secret")]
async fn regenerate_client_secret(client_id: OauthClientId, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let mut client = match OauthClient::find_by_id(&client_id, &conn).await {
        Some(client) => client,
        None => err_code!("Client not found", "NOT_FOUND", 404),
    };

    let plaintext_secret = client.regenerate_secret()?;
    client.save(&conn).await?;

    AdminLog::log(headers.user.id, "regenerate-client-secret", None, json!({"clientId": client_id}), &conn).await;

    Ok(api_success(json!({"clientSecret": plaintext_secret})))
}

#[derive(Deserialize)]
struct ToggleData {
    enabled: bool,
}

/// Disabling a client cascade-revokes everything it holds.
#[post("/clients/<client_id>/toggle", data = "<data>")]
async fn toggle_client(
    client_id: OauthClientId,
    data: Json<ToggleData>,
    headers: AdminHeaders,
    conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();

    let mut client = match OauthClient::find_by_id(&client_id, &conn).await {
        Some(client) => client,
        None => err_code!("Client not found", "NOT_FOUND", 404),
    };

    client.enabled = data.enabled;
    client.save(&conn).await?;

    if !data.enabled {
        oauth::revoke_client(&client_id, &conn).await?;
    }

    AdminLog::log(
        headers.user.id,
        "toggle-client",
        None,
        json!({"clientId": client_id, "enabled": data.enabled}),
        &conn,
    )
    .await;

    Ok(api_ok())
}

#[delete("/clients/<client_id>")]
async fn delete_client(client_id: OauthClientId, headers: SuperAdminHeaders, conn: DbConn) -> JsonResult {
    let client = match OauthClient::find_by_id(&client_id, &conn).await {
        Some(client) => client,
        None => err_code!("Client not found", "NOT_FOUND", 404),
    };

    // Revoke first so no token survives the registry row.
    oauth::revoke_client(&client_id, &conn).await?;
    client.delete(&conn).await?;

    AdminLog::log(headers.user.id, "delete-client", None, json!({"clientId": client_id}), &conn).await;

    Ok(api_ok())
}

//
// Audit logs
//

#[get("/logs/admin")]
async fn admin_logs(_headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let logs = AdminLog::find_recent(LOG_PAGE_SIZE, &conn).await;
    let entries: Vec<_> = logs.iter().map(AdminLog::to_json).collect();
    Ok(api_success(json!(entries)))
}

#[get("/logs/users/<user_id>")]
async fn user_logs(user_id: UserId, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let logs = UserLog::find_by_user(user_id, LOG_PAGE_SIZE, &conn).await;
    let entries: Vec<_> = logs.iter().map(UserLog::to_json).collect();
    Ok(api_success(json!(entries)))
}

/// User-cache health, mostly for operators chasing coherence bugs.
#[get("/cache/stats")]
fn cache_stats(_headers: AdminHeaders) -> JsonResult {
    Ok(api_success(USER_CACHE.stats().to_json()))
}
