use chrono::{Duration, NaiveDateTime, Utc};

use super::UserId;
use crate::api::{ApiResult, EmptyResult};
use crate::db::schema::qr_login_tokens;
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, CONFIG};

/// pending -> scanned -> (confirmed | cancelled). Terminal states are sinks;
/// every transition is a guarded update so out-of-order requests lose the
/// race instead of rewinding state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrLoginStatus {
    Pending = 0,
    Scanned = 1,
    Confirmed = 2,
    Cancelled = 3,
}

impl QrLoginStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(QrLoginStatus::Pending),
            1 => Some(QrLoginStatus::Scanned),
            2 => Some(QrLoginStatus::Confirmed),
            3 => Some(QrLoginStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_name(&self) -> &'static str {
        match self {
            QrLoginStatus::Pending => "pending",
            QrLoginStatus::Scanned => "scanned",
            QrLoginStatus::Confirmed => "confirmed",
            QrLoginStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QrLoginStatus::Confirmed | QrLoginStatus::Cancelled)
    }
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = qr_login_tokens)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(token))]
pub struct QrLoginToken {
    pub token: String,
    pub status: i32,
    pub user_id: Option<UserId>,
    pub session_token: Option<String>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl QrLoginToken {
    pub fn status(&self) -> Option<QrLoginStatus> {
        QrLoginStatus::from_i32(self.status)
    }

    pub fn is_expired(&self, now: &NaiveDateTime) -> bool {
        self.expires_at < *now
    }

    pub async fn generate(conn: &DbConn) -> ApiResult<Self> {
        let now = Utc::now().naive_utc();
        let row = Self {
            token: crypto::generate_token::<32>(),
            status: QrLoginStatus::Pending as i32,
            user_id: None,
            session_token: None,
            created_at: now,
            expires_at: now + Duration::seconds(CONFIG.qr_token_ttl_secs),
        };

        db_run! {conn: {
            diesel::insert_into(qr_login_tokens::table)
                .values(&row)
                .execute(conn)
                .map_res("Error saving QR login token")?;
            Ok(row)
        }}
    }

    pub async fn find(token: &str, conn: &DbConn) -> Option<Self> {
        let token = token.to_string();
        db_run! {conn: {
            qr_login_tokens::table
                .filter(qr_login_tokens::token.eq(token))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Classifies why a guarded transition affected zero rows, so callers can
    /// answer with an informative error instead of a blind failure.
    async fn classify_failure<T>(token: &str, conn: &DbConn) -> ApiResult<T> {
        let now = Utc::now().naive_utc();
        match Self::find(token, conn).await {
            None => err_code!("Unknown QR login token", "INVALID_TOKEN", 400),
            Some(row) if row.is_expired(&now) => {
                row.delete(conn).await.ok();
                err_code!("QR login token expired", "TOKEN_EXPIRED", 400)
            }
            Some(row) => match row.status() {
                Some(status) if status.is_terminal() => {
                    err_code!("QR login already completed", "TOKEN_USED", 409)
                }
                _ => err_code!("QR login token is not in the expected state", "TOKEN_USED", 409),
            },
        }
    }

    async fn transition(
        token: &str,
        from: QrLoginStatus,
        to: QrLoginStatus,
        conn: &DbConn,
    ) -> ApiResult<()> {
        let now = Utc::now().naive_utc();
        let token_owned = token.to_string();
        let updated: usize = db_run! {conn: {
            diesel::update(
                qr_login_tokens::table
                    .filter(qr_login_tokens::token.eq(&token_owned))
                    .filter(qr_login_tokens::status.eq(from as i32))
                    .filter(qr_login_tokens::expires_at.gt(now)),
            )
            .set(qr_login_tokens::status.eq(to as i32))
            .execute(conn)
            .unwrap_or(0)
        }};

        if updated == 0 {
            return Self::classify_failure(token, conn).await;
        }
        Ok(())
    }

    /// Phone announces it scanned the QR: pending -> scanned.
    pub async fn scan(token: &str, conn: &DbConn) -> ApiResult<()> {
        Self::transition(token, QrLoginStatus::Pending, QrLoginStatus::Scanned, conn).await
    }

    /// Phone confirms: scanned -> confirmed, binding the confirming user and
    /// the session bearer the desktop will pick up.
    pub async fn confirm(token: &str, user_id: UserId, session_token: &str, conn: &DbConn) -> ApiResult<()> {
        let now = Utc::now().naive_utc();
        let token_owned = token.to_string();
        let session_owned = session_token.to_string();
        let updated: usize = db_run! {conn: {
            diesel::update(
                qr_login_tokens::table
                    .filter(qr_login_tokens::token.eq(&token_owned))
                    .filter(qr_login_tokens::status.eq(QrLoginStatus::Scanned as i32))
                    .filter(qr_login_tokens::expires_at.gt(now)),
            )
            .set((
                qr_login_tokens::status.eq(QrLoginStatus::Confirmed as i32),
                qr_login_tokens::user_id.eq(Some(user_id)),
                qr_login_tokens::session_token.eq(Some(&session_owned)),
            ))
            .execute(conn)
            .unwrap_or(0)
        }};

        if updated == 0 {
            return Self::classify_failure(token, conn).await;
        }
        Ok(())
    }

    /// Phone declines: scanned -> cancelled.
    pub async fn cancel(token: &str, conn: &DbConn) -> ApiResult<()> {
        Self::transition(token, QrLoginStatus::Scanned, QrLoginStatus::Cancelled, conn).await
    }

    /// Desktop closed the dialog; any non-terminal token is simply deleted.
    pub async fn delete_non_terminal(token: &str, conn: &DbConn) -> EmptyResult {
        let token = token.to_string();
        db_run! {conn: {
            diesel::delete(
                qr_login_tokens::table
                    .filter(qr_login_tokens::token.eq(token))
                    .filter(qr_login_tokens::status.le(QrLoginStatus::Scanned as i32)),
            )
            .execute(conn)
            .map_res("Error deleting QR login token")
        }}
    }

    pub async fn delete(&self, conn: &DbConn) -> EmptyResult {
        let token = self.token.clone();
        db_run! {conn: {
            diesel::delete(qr_login_tokens::table.filter(qr_login_tokens::token.eq(token)))
                .execute(conn)
                .map_res("Error deleting QR login token")
        }}
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! {conn: {
            diesel::delete(qr_login_tokens::table.filter(qr_login_tokens::user_id.eq(Some(user_id))))
                .execute(conn)
                .map_res("Error deleting QR login tokens for user")
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! {conn: {
            diesel::delete(qr_login_tokens::table.filter(qr_login_tokens::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging QR login tokens")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired QR login tokens: {e:#?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in
            [QrLoginStatus::Pending, QrLoginStatus::Scanned, QrLoginStatus::Confirmed, QrLoginStatus::Cancelled]
        {
            assert_eq!(QrLoginStatus::from_i32(status as i32), Some(status));
        }
        assert_eq!(QrLoginStatus::from_i32(4), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!QrLoginStatus::Pending.is_terminal());
        assert!(!QrLoginStatus::Scanned.is_terminal());
        assert!(QrLoginStatus::Confirmed.is_terminal());
        assert!(QrLoginStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now().naive_utc();
        let row = QrLoginToken {
            token: "t".into(),
            status: 0,
            user_id: None,
            session_token: None,
            created_at: now,
            expires_at: now - Duration::seconds(1),
        };
        assert!(row.is_expired(&now));
    }
}
