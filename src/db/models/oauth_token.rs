use chrono::{NaiveDateTime, Utc};

use super::{OauthClientId, UserId};
use crate::api::{ApiResult, EmptyResult};
use crate::db::schema::{oauth_access_tokens, oauth_auth_codes, oauth_refresh_tokens};
use crate::db::DbConn;
use crate::error::MapResult;

/// Single-use credential swapped for a token pair at the token endpoint.
/// Stored as plaintext; it is short-lived and bound to one client.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = oauth_auth_codes)]
#[diesel(primary_key(code))]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub redirect_uri: String,
    pub scope: String,
    pub used: bool,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

/// Bearer row, keyed by the SHA-256 of the opaque plaintext. The plaintext
/// is returned once at mint time and never persisted.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = oauth_access_tokens)]
#[diesel(primary_key(token_hash))]
pub struct AccessToken {
    pub token_hash: String,
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub scope: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = oauth_refresh_tokens)]
#[diesel(primary_key(token_hash))]
pub struct RefreshToken {
    pub token_hash: String,
    /// The access token minted alongside; deleted together on rotation.
    pub access_token_hash: Option<String>,
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub scope: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl AuthorizationCode {
    pub fn new(
        code: String,
        client_id: OauthClientId,
        user_id: UserId,
        redirect_uri: String,
        scope: String,
        expires_at: NaiveDateTime,
    ) -> Self {
        Self {
            code,
            client_id,
            user_id,
            redirect_uri,
            scope,
            used: false,
            created_at: Utc::now().naive_utc(),
            expires_at,
        }
    }

    pub async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(oauth_auth_codes::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error saving authorization code")
        }}
    }

    pub async fn find(code: &str, conn: &DbConn) -> Option<Self> {
        let code = code.to_string();
        db_run! { conn: {
            oauth_auth_codes::table
                .filter(oauth_auth_codes::code.eq(code))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Flips `used`, guarded on it still being unused. Returns whether this
    /// caller won the race; the code is single-use system-wide.
    pub async fn mark_used(code: &str, conn: &DbConn) -> ApiResult<bool> {
        let code = code.to_string();
        let updated: usize = db_run! { conn: {
            diesel::update(
                oauth_auth_codes::table
                    .filter(oauth_auth_codes::code.eq(code))
                    .filter(oauth_auth_codes::used.eq(false)),
            )
            .set(oauth_auth_codes::used.eq(true))
            .execute(conn)
            .unwrap_or(0)
        }};
        Ok(updated == 1)
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(oauth_auth_codes::table.filter(oauth_auth_codes::user_id.eq(user_id)))
                .execute(conn)
                .map_res("Error deleting authorization codes for user")
        }}
    }

    pub async fn delete_all_by_client(client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(oauth_auth_codes::table.filter(oauth_auth_codes::client_id.eq(client_id)))
                .execute(conn)
                .map_res("Error deleting authorization codes for client")
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! { conn: {
            diesel::delete(oauth_auth_codes::table.filter(oauth_auth_codes::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging authorization codes")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired authorization codes: {e:#?}");
        }
    }
}

impl AccessToken {
    pub async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(oauth_access_tokens::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error saving access token")
        }}
    }

    pub async fn find_by_hash(token_hash: &str, conn: &DbConn) -> Option<Self> {
        let token_hash = token_hash.to_string();
        db_run! { conn: {
            oauth_access_tokens::table
                .filter(oauth_access_tokens::token_hash.eq(token_hash))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn delete_by_hash(token_hash: &str, conn: &DbConn) -> EmptyResult {
        let token_hash = token_hash.to_string();
        db_run! { conn: {
            diesel::delete(oauth_access_tokens::table.filter(oauth_access_tokens::token_hash.eq(token_hash)))
                .execute(conn)
                .map_res("Error deleting access token")
        }}
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(oauth_access_tokens::table.filter(oauth_access_tokens::user_id.eq(user_id)))
                .execute(conn)
                .map_res("Error deleting access tokens for user")
        }}
    }

    pub async fn delete_all_by_client(client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(oauth_access_tokens::table.filter(oauth_access_tokens::client_id.eq(client_id)))
                .execute(conn)
                .map_res("Error deleting access tokens for client")
        }}
    }

    pub async fn delete_all_by_user_client(user_id: UserId, client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(
                oauth_access_tokens::table
                    .filter(oauth_access_tokens::user_id.eq(user_id))
                    .filter(oauth_access_tokens::client_id.eq(client_id)),
            )
            .execute(conn)
            .map_res("Error deleting access tokens for user and client")
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! { conn: {
            diesel::delete(oauth_access_tokens::table.filter(oauth_access_tokens::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging access tokens")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired access tokens: {e:#?}");
        }
    }
}

impl RefreshToken {
    pub async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(oauth_refresh_tokens::table)
                .values(&*self)
                .execute(conn)
                .map_res("Error saving refresh token")
        }}
    }

    pub async fn find_by_hash(token_hash: &str, conn: &DbConn) -> Option<Self> {
        let token_hash = token_hash.to_string();
        db_run! { conn: {
            oauth_refresh_tokens::table
                .filter(oauth_refresh_tokens::token_hash.eq(token_hash))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn delete_by_hash(token_hash: &str, conn: &DbConn) -> EmptyResult {
        let token_hash = token_hash.to_string();
        db_run! { conn: {
            diesel::delete(oauth_refresh_tokens::table.filter(oauth_refresh_tokens::token_hash.eq(token_hash)))
                .execute(conn)
                .map_res("Error deleting refresh token")
        }}
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(oauth_refresh_tokens::table.filter(oauth_refresh_tokens::user_id.eq(user_id)))
                .execute(conn)
                .map_res("Error deleting refresh tokens for user")
        }}
    }

    pub async fn delete_all_by_client(client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(oauth_refresh_tokens::table.filter(oauth_refresh_tokens::client_id.eq(client_id)))
                .execute(conn)
                .map_res("Error deleting refresh tokens for client")
        }}
    }

    pub async fn delete_all_by_user_client(user_id: UserId, client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(
                oauth_refresh_tokens::table
                    .filter(oauth_refresh_tokens::user_id.eq(user_id))
                    .filter(oauth_refresh_tokens::client_id.eq(client_id)),
            )
            .execute(conn)
            .map_res("Error deleting refresh tokens for user and client")
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! { conn: {
            diesel::delete(oauth_refresh_tokens::table.filter(oauth_refresh_tokens::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging refresh tokens")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired refresh tokens: {e:#?}");
        }
    }
}
