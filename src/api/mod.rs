mod accounts;
mod admin;
pub mod notifications;
mod oauth;
mod qr_login;
mod sso;

use rocket::serde::json::Json;
use rocket::Catcher;
use serde_json::Value;

pub use crate::api::{
    accounts::routes as accounts_routes,
    admin::routes as admin_routes,
    notifications::routes as notifications_routes,
    notifications::{start_sweeper, ws_shutdown, WS_QR_SUBSCRIBERS},
    oauth::routes as oauth_routes,
    qr_login::routes as qr_login_routes,
    sso::routes as sso_routes,
};

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
pub type EmptyResult = ApiResult<()>;

/// The native JSON envelope: `{success, errorCode?, data?}`.
pub fn api_success(data: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data,
    }))
}

/// Success without a payload.
pub fn api_ok() -> Json<Value> {
    Json(json!({
        "success": true,
    }))
}

fn error_body(code: &str) -> Value {
    json!({
        "success": false,
        "errorCode": code,
    })
}

pub fn catchers() -> Vec<Catcher> {
    catchers![bad_request, unauthorized, forbidden, not_found, payload_too_large, unprocessable, too_many_requests, internal_error]
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    Json(error_body("INTERNAL_ERROR"))
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    Json(error_body("UNAUTHORIZED"))
}

#[catch(403)]
fn forbidden() -> Json<Value> {
    Json(error_body("ACCESS_DENIED"))
}

#[catch(404)]
fn not_found() -> Json<Value> {
    Json(error_body("NOT_FOUND"))
}

#[catch(413)]
fn payload_too_large() -> Json<Value> {
    Json(error_body("REQUEST_TOO_LARGE"))
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    Json(error_body("INTERNAL_ERROR"))
}

#[catch(429)]
fn too_many_requests() -> Json<Value> {
    Json(error_body("RATE_LIMITED"))
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    Json(error_body("INTERNAL_ERROR"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let body = api_success(json!({"id": 7})).into_inner();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 7);
        assert!(body.get("errorCode").is_none());
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = error_body("RATE_LIMITED");
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], "RATE_LIMITED");
        assert!(body.get("data").is_none());
    }
}
