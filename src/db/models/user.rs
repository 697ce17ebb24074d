use chrono::{NaiveDateTime, Utc};
use derive_more::{Display, From};
use diesel_derive_newtype::DieselNewType;
use macros::NumIdFromParam;
use serde_json::Value;

use crate::db::schema::users;
use crate::CONFIG;

#[derive(
    Clone, Copy, Debug, DieselNewType, Display, From, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    NumIdFromParam,
)]
pub struct UserId(i64);

impl UserId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Integer-ordered so `admin <= super-admin` gating works with plain
/// comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserRole {
    Regular = 0,
    Admin = 1,
    SuperAdmin = 2,
}

impl UserRole {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(UserRole::Regular),
            1 => Some(UserRole::Admin),
            2 => Some(UserRole::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Regular => "regular",
            UserRole::Admin => "admin",
            UserRole::SuperAdmin => "super-admin",
        }
    }
}

/// The avatar column value meaning "resolve to the federation avatar at
/// read time".
pub const AVATAR_MICROSOFT_SENTINEL: &str = "microsoft";

#[derive(Clone, Identifiable, Queryable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: String,
    pub role: i32,

    // Federation facet, written only by the reconciler. Nullable as a unit.
    pub microsoft_id: Option<String>,
    pub microsoft_name: Option<String>,
    pub microsoft_avatar_url: Option<String>,
    pub microsoft_avatar_hash: Option<String>,

    // Ban facet, written only by the admin path.
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub banned_at: Option<NaiveDateTime>,
    pub banned_by: Option<i64>,
    pub unban_at: Option<NaiveDateTime>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: String,
    pub role: i32,
    pub microsoft_id: Option<String>,
    pub microsoft_name: Option<String>,
    pub microsoft_avatar_url: Option<String>,
    pub microsoft_avatar_hash: Option<String>,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub banned_at: Option<NaiveDateTime>,
    pub banned_by: Option<i64>,
    pub unban_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl NewUser {
    pub fn new(username: String, email: String, password: &str) -> Result<Self, crate::error::Error> {
        let now = Utc::now().naive_utc();
        let email = crate::util::normalize_email(&email);

        let role = match CONFIG.super_admin_email.as_deref() {
            Some(admin_email) if admin_email == email.as_str() => UserRole::SuperAdmin,
            _ => UserRole::Regular,
        };

        Ok(Self {
            username,
            email,
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
            avatar: String::new(),
            role: role as i32,
            microsoft_id: None,
            microsoft_name: None,
            microsoft_avatar_url: None,
            microsoft_avatar_hash: None,
            banned: false,
            ban_reason: None,
            banned_at: None,
            banned_by: None,
            unban_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

impl User {
    pub fn check_valid_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }

    pub fn set_password(&mut self, password: &str) -> Result<(), crate::error::Error> {
        self.password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        Ok(())
    }

    pub fn role(&self) -> UserRole {
        UserRole::from_i32(self.role).unwrap_or(UserRole::Regular)
    }

    pub fn has_federation(&self) -> bool {
        self.microsoft_id.is_some()
    }

    /// A ban is effective while the flag is set and no unban instant has
    /// passed. `unban_at = None` means permanent.
    pub fn is_banned(&self, now: &NaiveDateTime) -> bool {
        self.banned
            && match self.unban_at {
                Some(unban_at) => unban_at > *now,
                None => true,
            }
    }

    /// The single projection of the avatar sentinel, applied at every
    /// outward boundary.
    pub fn resolved_avatar(&self) -> String {
        if self.avatar == AVATAR_MICROSOFT_SENTINEL {
            self.microsoft_avatar_url.clone().unwrap_or_default()
        } else {
            self.avatar.clone()
        }
    }

    pub fn set_ban(&mut self, reason: Option<String>, banned_by: UserId, unban_at: Option<NaiveDateTime>) {
        self.banned = true;
        self.ban_reason = reason;
        self.banned_at = Some(Utc::now().naive_utc());
        self.banned_by = Some(banned_by.as_i64());
        self.unban_at = unban_at;
    }

    pub fn clear_ban(&mut self) {
        self.banned = false;
        self.ban_reason = None;
        self.banned_at = None;
        self.banned_by = None;
        self.unban_at = None;
    }

    pub fn set_federation(&mut self, microsoft_id: String, name: String) {
        self.microsoft_id = Some(microsoft_id);
        self.microsoft_name = Some(name);
    }

    /// Clears the whole federation facet in one update. The caller handles
    /// the async deletion of any stored avatar artifact.
    pub fn clear_federation(&mut self) {
        self.microsoft_id = None;
        self.microsoft_name = None;
        self.microsoft_avatar_url = None;
        self.microsoft_avatar_hash = None;
        if self.avatar == AVATAR_MICROSOFT_SENTINEL {
            self.avatar = String::new();
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "avatarUrl": self.resolved_avatar(),
            "role": self.role().as_str(),
            "microsoftLinked": self.has_federation(),
            "microsoftName": self.microsoft_name,
            "createdAt": crate::util::format_naive_datetime(&self.created_at),
        })
    }

    pub fn to_admin_json(&self) -> Value {
        let mut json = self.to_json();
        json["banned"] = json!(self.banned);
        json["banReason"] = json!(self.ban_reason);
        json["bannedAt"] = json!(self.banned_at.as_ref().map(crate::util::format_naive_datetime));
        json["unbanAt"] = json!(self.unban_at.as_ref().map(crate::util::format_naive_datetime));
        json
    }
}

use crate::api::{ApiResult, EmptyResult};
use crate::db::DbConn;
use crate::error::MapResult;

use super::{AccessToken, AuthorizationCode, OauthGrant, QrLoginToken, RefreshToken, UserLog};

/// Database methods
impl User {
    pub async fn create(user: NewUser, conn: &DbConn) -> ApiResult<User> {
        if user.email.trim().is_empty() {
            err!("User email can't be empty")
        }

        let email = user.email.clone();
        db_run! {conn: {
            diesel::insert_into(users::table)
                .values(&user)
                .execute(conn)
                .map_res("Error creating user")?;
            users::table
                .filter(users::email.eq(&email))
                .first::<User>(conn)
                .ok()
                .map_res("Error loading created user")
        }}
    }

    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        if self.email.trim().is_empty() {
            err!("User email can't be empty")
        }

        self.updated_at = Utc::now().naive_utc();

        db_run! {conn: {
            crate::util::retry(
                || diesel::update(users::table.filter(users::id.eq(self.id))).set(&*self).execute(conn),
                10,
            )
            .map_res("Error saving user")
        }}
    }

    /// Deletion cascades into every OAuth row referencing the user.
    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        AccessToken::delete_all_by_user(self.id, conn).await?;
        RefreshToken::delete_all_by_user(self.id, conn).await?;
        AuthorizationCode::delete_all_by_user(self.id, conn).await?;
        OauthGrant::delete_all_by_user(self.id, conn).await?;
        QrLoginToken::delete_all_by_user(self.id, conn).await?;
        UserLog::delete_all_by_user(self.id, conn).await?;

        db_run! {conn: {
            diesel::delete(users::table.filter(users::id.eq(self.id)))
                .execute(conn)
                .map_res("Error deleting user")
        }}
    }

    pub async fn find_by_id(id: UserId, conn: &DbConn) -> Option<Self> {
        db_run! {conn: {
            users::table.filter(users::id.eq(id)).first::<Self>(conn).ok()
        }}
    }

    pub async fn find_by_email(email: &str, conn: &DbConn) -> Option<Self> {
        let lower_mail = crate::util::normalize_email(email);
        db_run! {conn: {
            users::table
                .filter(users::email.eq(lower_mail))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_username(username: &str, conn: &DbConn) -> Option<Self> {
        let username = username.to_string();
        db_run! {conn: {
            users::table
                .filter(users::username.eq(username))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_microsoft_id(microsoft_id: &str, conn: &DbConn) -> Option<Self> {
        let microsoft_id = microsoft_id.to_string();
        db_run! {conn: {
            users::table
                .filter(users::microsoft_id.eq(microsoft_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn get_all(conn: &DbConn) -> Vec<Self> {
        db_run! {conn: {
            users::table.order(users::id.asc()).load::<Self>(conn).expect("Error loading users")
        }}
    }

    pub async fn search(term: &str, conn: &DbConn) -> Vec<Self> {
        let pattern = format!("%{}%", term.to_lowercase());
        db_run! {conn: {
            users::table
                .filter(users::email.like(&pattern).or(users::username.like(&pattern)))
                .order(users::id.asc())
                .load::<Self>(conn)
                .expect("Error searching users")
        }}
    }

    /// Re-reads the ban facet from the authoritative store, bypassing the
    /// user cache. Freshness here is security-critical.
    pub async fn is_banned_fresh(id: UserId, conn: &DbConn) -> Option<bool> {
        let row: Option<(bool, Option<NaiveDateTime>)> = db_run! {conn: {
            users::table
                .filter(users::id.eq(id))
                .select((users::banned, users::unban_at))
                .first::<(bool, Option<NaiveDateTime>)>(conn)
                .ok()
        }};

        let now = Utc::now().naive_utc();
        row.map(|(banned, unban_at)| {
            banned
                && match unban_at {
                    Some(unban_at) => unban_at > now,
                    None => true,
                }
        })
    }

    /// Re-reads the role from the authoritative store, bypassing the cache.
    pub async fn role_fresh(id: UserId, conn: &DbConn) -> Option<UserRole> {
        let role: Option<i32> = db_run! {conn: {
            users::table.filter(users::id.eq(id)).select(users::role).first::<i32>(conn).ok()
        }};
        role.and_then(UserRole::from_i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        let now = Utc::now().naive_utc();
        User {
            id: UserId::from(1),
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            avatar: String::new(),
            role: 0,
            microsoft_id: None,
            microsoft_name: None,
            microsoft_avatar_url: None,
            microsoft_avatar_hash: None,
            banned: false,
            ban_reason: None,
            banned_at: None,
            banned_by: None,
            unban_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_role_ordering_gates() {
        assert!(UserRole::Admin >= UserRole::Admin);
        assert!(UserRole::SuperAdmin >= UserRole::Admin);
        assert!(UserRole::Regular < UserRole::Admin);
    }

    #[test]
    fn test_role_from_i32_rejects_unknown() {
        assert_eq!(UserRole::from_i32(1), Some(UserRole::Admin));
        assert_eq!(UserRole::from_i32(9), None);
    }

    #[test]
    fn test_avatar_sentinel_resolves_to_federation_avatar() {
        let mut user = sample_user();
        user.avatar = AVATAR_MICROSOFT_SENTINEL.into();
        user.microsoft_avatar_url = Some("https://cdn.example/avatar.png".into());
        assert_eq!(user.resolved_avatar(), "https://cdn.example/avatar.png");

        user.microsoft_avatar_url = None;
        assert_eq!(user.resolved_avatar(), "");

        user.avatar = "https://cdn.example/own.png".into();
        assert_eq!(user.resolved_avatar(), "https://cdn.example/own.png");
    }

    #[test]
    fn test_temporary_ban_expires() {
        let mut user = sample_user();
        let now = Utc::now().naive_utc();

        user.set_ban(Some("spam".into()), UserId::from(2), Some(now + chrono::Duration::hours(1)));
        assert!(user.is_banned(&now));

        user.unban_at = Some(now - chrono::Duration::seconds(1));
        assert!(!user.is_banned(&now));

        user.unban_at = None;
        assert!(user.is_banned(&now));
    }

    #[test]
    fn test_clear_federation_resets_sentinel_avatar() {
        let mut user = sample_user();
        user.set_federation("ms-123".into(), "Alice".into());
        user.avatar = AVATAR_MICROSOFT_SENTINEL.into();
        user.microsoft_avatar_url = Some("https://cdn.example/a.png".into());
        user.microsoft_avatar_hash = Some("deadbeef".into());

        user.clear_federation();
        assert!(!user.has_federation());
        assert_eq!(user.avatar, "");
        assert!(user.microsoft_avatar_url.is_none());
        assert!(user.microsoft_avatar_hash.is_none());
    }

    #[test]
    fn test_userinfo_projection_hides_ban_details() {
        let user = sample_user();
        let json = user.to_json();
        assert!(json.get("banned").is_none());
        assert_eq!(json["username"], "alice");
    }
}
