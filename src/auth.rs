//
// Session bearer handling (HMAC-SHA256 JWT)
//
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;

use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::{
    crypto,
    error::Error,
    CONFIG,
};

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

static JWT_HEADER: Lazy<Header> = Lazy::new(|| Header::new(JWT_ALGORITHM));

pub static JWT_SESSION_ISSUER: Lazy<String> = Lazy::new(|| format!("{}|session", CONFIG.domain_origin()));

static SESSION_SECRET: Lazy<Vec<u8>> = Lazy::new(|| {
    load_or_create_secret().unwrap_or_else(|e| panic!("Error loading session secret.\n{e}"))
});
static ENCODING_KEY: Lazy<EncodingKey> = Lazy::new(|| EncodingKey::from_secret(&SESSION_SECRET));
static DECODING_KEY: Lazy<DecodingKey> = Lazy::new(|| DecodingKey::from_secret(&SESSION_SECRET));

/// Loads the HMAC secret from the data folder, generating it on first boot
/// so sessions survive restarts.
fn load_or_create_secret() -> Result<Vec<u8>, Error> {
    let path = &CONFIG.session_secret_file;
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    if crate::util::file_exists(path) {
        let secret = std::fs::read(path)?;
        if secret.len() < 32 {
            err!("The session secret file is too short to be safe, delete it to regenerate");
        }
        Ok(secret)
    } else {
        let secret = crypto::get_random_bytes::<64>().to_vec();
        std::fs::write(path, &secret)?;
        info!("Generated a new session secret at {path}");
        Ok(secret)
    }
}

pub fn load_keys() {
    Lazy::force(&ENCODING_KEY);
    Lazy::force(&DECODING_KEY);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionJwtClaims {
    // Not before
    pub nbf: i64,
    // Issued at
    pub iat: i64,
    // Expiration time
    pub exp: i64,
    // Issuer
    pub iss: String,
    // Subject: the user id as a decimal string
    pub sub: String,
}

pub fn generate_session_claims(user_id: UserId) -> SessionJwtClaims {
    let time_now = Utc::now();
    SessionJwtClaims {
        nbf: time_now.timestamp(),
        iat: time_now.timestamp(),
        exp: (time_now + Duration::seconds(CONFIG.session_lifetime_secs)).timestamp(),
        iss: JWT_SESSION_ISSUER.to_string(),
        sub: user_id.to_string(),
    }
}

pub fn encode_session(claims: &SessionJwtClaims) -> String {
    match jsonwebtoken::encode(&JWT_HEADER, claims, &ENCODING_KEY) {
        Ok(token) => token,
        Err(e) => panic!("Error encoding session jwt {e}"),
    }
}

/// Mints a fresh bearer for the given user.
pub fn mint_session(user_id: UserId) -> String {
    encode_session(&generate_session_claims(user_id))
}

/// Verifies a bearer. Malformed, expired, signature-invalid and
/// not-yet-valid tokens all surface as distinct log messages behind the
/// same UNAUTHORIZED wire code.
pub fn decode_session(token: &str) -> Result<SessionJwtClaims, Error> {
    let mut validation = Validation::new(JWT_ALGORITHM);
    validation.leeway = 30; // 30 seconds
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.set_issuer(&[JWT_SESSION_ISSUER.as_str()]);

    let token = token.replace(char::is_whitespace, "");
    match jsonwebtoken::decode::<SessionJwtClaims>(&token, &DECODING_KEY, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => {
            let msg = match e.kind() {
                ErrorKind::ExpiredSignature => "Session token expired",
                ErrorKind::ImmatureSignature => "Session token not yet valid",
                ErrorKind::InvalidSignature => "Session token signature is invalid",
                _ => "Session token is malformed",
            };
            Err(Error::new("Session verification failed", msg).with_code("UNAUTHORIZED", 401))
        }
    }
}

/// Extracts the user id carried in the subject claim.
pub fn session_user_id(claims: &SessionJwtClaims) -> Result<UserId, Error> {
    match claims.sub.parse::<i64>() {
        Ok(id) if id > 0 => Ok(UserId::from(id)),
        _ => Err(Error::new("Session subject is not a user id", "Session subject is not a user id")
            .with_code("UNAUTHORIZED", 401)),
    }
}

//
// Session cookie
//
use rocket::http::{Cookie, CookieJar, SameSite};

pub const SESSION_COOKIE: &str = "token";

pub fn set_session_cookie(jar: &CookieJar<'_>, token: String) {
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(CONFIG.is_https())
        .path("/")
        .max_age(rocket::time::Duration::seconds(CONFIG.session_lifetime_secs));
    jar.add(cookie);
}

pub fn clear_session_cookie(jar: &CookieJar<'_>) {
    jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/"));
}

//
// Bearer token authentication
//
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::cache::USER_CACHE;
use crate::db::{
    models::{User, UserId, UserRole},
    DbConn,
};

fn extract_bearer(request: &Request<'_>) -> Option<String> {
    if let Some(header) = request.headers().get_one("Authorization") {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    request.cookies().get(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// An authenticated, non-banned user. The user row is served from the user
/// cache; the ban gate re-reads the authoritative store because its
/// freshness is security-critical.
pub struct Headers {
    pub user: User,
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Headers {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = match ClientIp::from_request(request).await {
            Outcome::Success(ip) => ip.ip,
            _ => err_handler!("Error getting client IP"),
        };

        let access_token = match extract_bearer(request) {
            Some(token) => token,
            None => err_handler!("No session token provided"),
        };

        let claims = match decode_session(&access_token) {
            Ok(claims) => claims,
            Err(_) => err_handler!("Invalid session token"),
        };

        let user_id = match session_user_id(&claims) {
            Ok(id) => id,
            Err(_) => err_handler!("Invalid session subject"),
        };

        let conn = match DbConn::from_request(request).await {
            Outcome::Success(conn) => conn,
            _ => err_handler!("Error getting DB connection"),
        };

        let user = match USER_CACHE.get_or_load(user_id, || User::find_by_id(user_id, &conn)).await {
            Some(user) => user,
            None => err_handler!("Session user no longer exists"),
        };

        // Ban gate, bypassing the cache.
        match User::is_banned_fresh(user_id, &conn).await {
            Some(false) => {}
            Some(true) => err_handler!("User is banned", Status::Forbidden),
            None => err_handler!("Session user no longer exists"),
        }

        Outcome::Success(Headers {
            user: (*user).clone(),
            ip,
        })
    }
}

/// Role gate: admin or better. Admin routes fail with a plain 404 so their
/// existence is not advertised.
pub struct AdminHeaders {
    pub user: User,
    pub role: UserRole,
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminHeaders {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = match Headers::from_request(request).await {
            Outcome::Success(headers) => headers,
            Outcome::Error(_) => err_handler!("Admin route requires a session", Status::NotFound),
            Outcome::Forward(f) => return Outcome::Forward(f),
        };

        let conn = match DbConn::from_request(request).await {
            Outcome::Success(conn) => conn,
            _ => err_handler!("Error getting DB connection", Status::NotFound),
        };

        // Role gate, bypassing the cache.
        let role = match User::role_fresh(headers.user.id, &conn).await {
            Some(role) => role,
            None => err_handler!("Session user no longer exists", Status::NotFound),
        };

        if role < UserRole::Admin {
            err_handler!("User is not an admin", Status::NotFound);
        }

        Outcome::Success(AdminHeaders {
            user: headers.user,
            role,
            ip: headers.ip,
        })
    }
}

pub struct SuperAdminHeaders {
    pub user: User,
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SuperAdminHeaders {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AdminHeaders::from_request(request).await {
            Outcome::Success(headers) => {
                if headers.role < UserRole::SuperAdmin {
                    err_handler!("User is not a super-admin", Status::NotFound);
                }
                Outcome::Success(SuperAdminHeaders {
                    user: headers.user,
                    ip: headers.ip,
                })
            }
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Forward(f) => Outcome::Forward(f),
        }
    }
}

//
// Client IP address detection
//
use std::net::IpAddr;

pub struct ClientIp {
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req.headers().get_one(&CONFIG.ip_header).and_then(|ip| {
            match ip.find(',') {
                Some(idx) => &ip[..idx],
                None => ip,
            }
            .parse()
            .map_err(|_| warn!("'{}' header is malformed: {ip}", CONFIG.ip_header))
            .ok()
        });

        let ip = ip.or_else(|| req.client_ip()).unwrap_or_else(|| "0.0.0.0".parse().unwrap());

        Outcome::Success(ClientIp {
            ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_claims(user_id: i64, nbf_offset: i64, exp_offset: i64) -> SessionJwtClaims {
        let now = Utc::now();
        SessionJwtClaims {
            nbf: (now + Duration::seconds(nbf_offset)).timestamp(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(exp_offset)).timestamp(),
            iss: JWT_SESSION_ISSUER.to_string(),
            sub: user_id.to_string(),
        }
    }

    #[test]
    fn test_session_round_trip() {
        let token = encode_session(&test_claims(42, 0, 3600));
        let claims = decode_session(&token).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(session_user_id(&claims).unwrap(), UserId::from(42));
    }

    #[test]
    fn test_expired_session_is_rejected() {
        let token = encode_session(&test_claims(42, -7200, -3600));
        assert!(decode_session(&token).is_err());
    }

    #[test]
    fn test_not_yet_valid_session_is_rejected() {
        let token = encode_session(&test_claims(42, 3600, 7200));
        assert!(decode_session(&token).is_err());
    }

    #[test]
    fn test_tampered_session_is_rejected() {
        // Graft the payload of one token onto the signature of another.
        let token_a = encode_session(&test_claims(42, 0, 3600));
        let token_b = encode_session(&test_claims(43, 0, 3600));
        let parts_a: Vec<&str> = token_a.split('.').collect();
        let parts_b: Vec<&str> = token_b.split('.').collect();
        let grafted = format!("{}.{}.{}", parts_a[0], parts_b[1], parts_a[2]);
        assert!(decode_session(&grafted).is_err());
    }

    #[test]
    fn test_malformed_session_is_rejected() {
        assert!(decode_session("not-a-jwt").is_err());
        assert!(decode_session("").is_err());
    }

    #[test]
    fn test_session_subject_must_be_positive_integer() {
        let mut claims = test_claims(42, 0, 3600);
        claims.sub = "abc".into();
        assert!(session_user_id(&claims).is_err());
        claims.sub = "-1".into();
        assert!(session_user_id(&claims).is_err());
    }
}
