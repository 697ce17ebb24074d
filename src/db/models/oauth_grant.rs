use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use super::{OauthClientId, UserId};
use crate::api::EmptyResult;
use crate::db::schema::oauth_grants;
use crate::db::DbConn;
use crate::error::MapResult;

/// The persistent fact that a user authorized a client, distinct from any
/// particular token. Unique per (user, client); issuing a new authorization
/// code refreshes the scope set and `updated_at`.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = oauth_grants)]
#[diesel(primary_key(user_id, client_id))]
pub struct OauthGrant {
    pub user_id: UserId,
    pub client_id: OauthClientId,
    pub scope: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl OauthGrant {
    pub fn to_json(&self) -> Value {
        json!({
            "clientId": self.client_id,
            "scope": self.scope,
            "createdAt": crate::util::format_naive_datetime(&self.created_at),
            "updatedAt": crate::util::format_naive_datetime(&self.updated_at),
        })
    }

    pub async fn upsert(user_id: UserId, client_id: &OauthClientId, scope: &str, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        let created_at = match Self::find(user_id, client_id, conn).await {
            Some(existing) => existing.created_at,
            None => now,
        };

        let grant = Self {
            user_id,
            client_id: client_id.clone(),
            scope: scope.to_string(),
            created_at,
            updated_at: now,
        };

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(oauth_grants::table)
                    .values(&grant)
                    .execute(conn)
                    .map_res("Error saving OAuth grant")
            }
            postgresql {
                diesel::insert_into(oauth_grants::table)
                    .values(&grant)
                    .on_conflict((oauth_grants::user_id, oauth_grants::client_id))
                    .do_update()
                    .set(&grant)
                    .execute(conn)
                    .map_res("Error saving OAuth grant")
            }
        }
    }

    pub async fn find(user_id: UserId, client_id: &OauthClientId, conn: &DbConn) -> Option<Self> {
        let client_id = client_id.clone();
        db_run! { conn: {
            oauth_grants::table
                .filter(oauth_grants::user_id.eq(user_id))
                .filter(oauth_grants::client_id.eq(client_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_user(user_id: UserId, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            oauth_grants::table
                .filter(oauth_grants::user_id.eq(user_id))
                .order(oauth_grants::created_at.asc())
                .load::<Self>(conn)
                .expect("Error loading OAuth grants")
        }}
    }

    pub async fn delete(user_id: UserId, client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(
                oauth_grants::table
                    .filter(oauth_grants::user_id.eq(user_id))
                    .filter(oauth_grants::client_id.eq(client_id)),
            )
            .execute(conn)
            .map_res("Error deleting OAuth grant")
        }}
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(oauth_grants::table.filter(oauth_grants::user_id.eq(user_id)))
                .execute(conn)
                .map_res("Error deleting OAuth grants for user")
        }}
    }

    pub async fn delete_all_by_client(client_id: &OauthClientId, conn: &DbConn) -> EmptyResult {
        let client_id = client_id.clone();
        db_run! { conn: {
            diesel::delete(oauth_grants::table.filter(oauth_grants::client_id.eq(client_id)))
                .execute(conn)
                .map_res("Error deleting OAuth grants for client")
        }}
    }
}
