use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use diesel_derive_newtype::DieselNewType;
use macros::IdFromParam;
use serde_json::Value;

use crate::api::{ApiResult, EmptyResult};
use crate::crypto;
use crate::db::schema::oauth_clients;
use crate::db::DbConn;
use crate::error::MapResult;

#[derive(
    Clone, Debug, DieselNewType, Display, From, AsRef, Deref, Hash, PartialEq, Eq, Serialize, Deserialize, IdFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct OauthClientId(String);

/// Secrets are never stored; only their bcrypt hash survives creation.
#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = oauth_clients)]
#[diesel(primary_key(client_id))]
pub struct OauthClient {
    pub client_id: OauthClientId,
    pub secret_hash: String,
    pub name: String,
    pub description: String,
    pub redirect_uri: String,
    pub enabled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

pub struct NewOauthClient {
    pub client: OauthClient,
    /// Shown exactly once at creation time.
    pub plaintext_secret: String,
}

impl OauthClient {
    pub fn new(name: String, description: String, redirect_uri: String) -> ApiResult<NewOauthClient> {
        let now = Utc::now().naive_utc();
        let plaintext_secret = crypto::generate_token::<32>();

        let client = Self {
            client_id: OauthClientId::from(crypto::generate_token::<16>()),
            secret_hash: bcrypt::hash(&plaintext_secret, bcrypt::DEFAULT_COST)?,
            name,
            description,
            redirect_uri,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        Ok(NewOauthClient {
            client,
            plaintext_secret,
        })
    }

    pub fn check_valid_secret(&self, secret: &str) -> bool {
        bcrypt::verify(secret, &self.secret_hash).unwrap_or(false)
    }

    /// Replaces the secret hash. Previously issued tokens stay valid; the
    /// secret authenticates token requests, not existing tokens.
    pub fn regenerate_secret(&mut self) -> ApiResult<String> {
        let plaintext_secret = crypto::generate_token::<32>();
        self.secret_hash = bcrypt::hash(&plaintext_secret, bcrypt::DEFAULT_COST)?;
        Ok(plaintext_secret)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "clientId": self.client_id,
            "name": self.name,
            "description": self.description,
            "redirectUri": self.redirect_uri,
            "enabled": self.enabled,
            "createdAt": crate::util::format_naive_datetime(&self.created_at),
            "updatedAt": crate::util::format_naive_datetime(&self.updated_at),
        })
    }
}

/// Database methods
impl OauthClient {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(oauth_clients::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving OAuth client")
            }
            postgresql {
                diesel::insert_into(oauth_clients::table)
                    .values(&*self)
                    .on_conflict(oauth_clients::client_id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving OAuth client")
            }
        }
    }

    pub async fn find_by_id(client_id: &OauthClientId, conn: &DbConn) -> Option<Self> {
        let client_id = client_id.clone();
        db_run! { conn: {
            oauth_clients::table
                .filter(oauth_clients::client_id.eq(client_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn get_all(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            oauth_clients::table
                .order(oauth_clients::created_at.asc())
                .load::<Self>(conn)
                .expect("Error loading OAuth clients")
        }}
    }

    /// The caller cascade-revokes first; this only removes the registry row.
    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        let client_id = self.client_id;
        db_run! { conn: {
            diesel::delete(oauth_clients::table.filter(oauth_clients::client_id.eq(client_id)))
                .execute(conn)
                .map_res("Error deleting OAuth client")
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_id_is_32_hex_chars() {
        let created = OauthClient::new("App".into(), String::new(), "https://app.example/cb".into()).unwrap();
        assert_eq!(created.client.client_id.len(), 32);
        assert!(created.client.client_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secret_verifies_and_is_not_stored_in_plaintext() {
        let created = OauthClient::new("App".into(), String::new(), "https://app.example/cb".into()).unwrap();
        assert!(created.client.check_valid_secret(&created.plaintext_secret));
        assert!(!created.client.check_valid_secret("wrong"));
        assert_ne!(created.client.secret_hash, created.plaintext_secret);
    }

    #[test]
    fn test_regenerated_secret_replaces_old() {
        let mut created = OauthClient::new("App".into(), String::new(), "https://app.example/cb".into()).unwrap();
        let old = created.plaintext_secret.clone();
        let new = created.client.regenerate_secret().unwrap();
        assert!(created.client.check_valid_secret(&new));
        assert!(!created.client.check_valid_secret(&old));
    }
}
