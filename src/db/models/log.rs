use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::Value;

use super::UserId;
use crate::api::EmptyResult;
use crate::db::schema::{admin_logs, user_logs};
use crate::db::DbConn;
use crate::error::MapResult;

/// Append-only audit trail of admin actions.
#[derive(Identifiable, Queryable)]
#[diesel(table_name = admin_logs)]
pub struct AdminLog {
    pub id: i64,
    pub admin_id: i64,
    pub action: String,
    pub target_id: Option<i64>,
    pub details: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = admin_logs)]
struct NewAdminLog {
    admin_id: i64,
    action: String,
    target_id: Option<i64>,
    details: String,
    created_at: NaiveDateTime,
}

/// Per-user activity trail, retained for a bounded window.
#[derive(Identifiable, Queryable)]
#[diesel(table_name = user_logs)]
pub struct UserLog {
    pub id: i64,
    pub user_id: i64,
    pub action: String,
    pub details: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = user_logs)]
struct NewUserLog {
    user_id: i64,
    action: String,
    details: String,
    created_at: NaiveDateTime,
}

impl AdminLog {
    /// Log failures degrade observability, not correctness; callers never
    /// fail on them.
    pub async fn log(admin_id: UserId, action: &str, target_id: Option<UserId>, details: Value, conn: &DbConn) {
        let row = NewAdminLog {
            admin_id: admin_id.as_i64(),
            action: action.to_string(),
            target_id: target_id.map(|id| id.as_i64()),
            details: details.to_string(),
            created_at: Utc::now().naive_utc(),
        };

        let res: EmptyResult = db_run! { conn: {
            diesel::insert_into(admin_logs::table)
                .values(&row)
                .execute(conn)
                .map_res("Error saving admin log")
        }};
        if let Err(e) = res {
            warn!("Failed to write admin log ({action}): {e:#?}");
        }
    }

    pub async fn find_recent(limit: i64, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            admin_logs::table
                .order(admin_logs::created_at.desc())
                .limit(limit)
                .load::<Self>(conn)
                .expect("Error loading admin logs")
        }}
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "adminId": self.admin_id,
            "action": self.action,
            "targetId": self.target_id,
            "details": serde_json::from_str::<Value>(&self.details).unwrap_or(Value::Null),
            "createdAt": crate::util::format_naive_datetime(&self.created_at),
        })
    }
}

impl UserLog {
    pub async fn log(user_id: UserId, action: &str, details: Value, conn: &DbConn) {
        let row = NewUserLog {
            user_id: user_id.as_i64(),
            action: action.to_string(),
            details: details.to_string(),
            created_at: Utc::now().naive_utc(),
        };

        let res: EmptyResult = db_run! { conn: {
            diesel::insert_into(user_logs::table)
                .values(&row)
                .execute(conn)
                .map_res("Error saving user log")
        }};
        if let Err(e) = res {
            warn!("Failed to write user log ({action}): {e:#?}");
        }
    }

    pub async fn find_by_user(user_id: UserId, limit: i64, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            user_logs::table
                .filter(user_logs::user_id.eq(user_id.as_i64()))
                .order(user_logs::created_at.desc())
                .limit(limit)
                .load::<Self>(conn)
                .expect("Error loading user logs")
        }}
    }

    pub async fn delete_all_by_user(user_id: UserId, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(user_logs::table.filter(user_logs::user_id.eq(user_id.as_i64())))
                .execute(conn)
                .map_res("Error deleting user logs")
        }}
    }

    /// Retention sweep; user logs are kept for a bounded number of days.
    pub async fn prune_old(retention_days: i64, conn: &DbConn) {
        let cutoff = Utc::now().naive_utc() - Duration::days(retention_days);
        let res: EmptyResult = db_run! { conn: {
            diesel::delete(user_logs::table.filter(user_logs::created_at.lt(cutoff)))
                .execute(conn)
                .map_res("Error pruning user logs")
        }};
        if let Err(e) = res {
            warn!("Failed to prune old user logs: {e:#?}");
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "action": self.action,
            "details": serde_json::from_str::<Value>(&self.details).unwrap_or(Value::Null),
            "createdAt": crate::util::format_naive_datetime(&self.created_at),
        })
    }
}
