use chrono::{Duration, NaiveDateTime, Utc};

use crate::api::{ApiResult, EmptyResult};
use crate::db::schema::{one_shot_tokens, verification_codes};
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, CONFIG};

/// What a mailed token or numeric code is allowed to be spent on. A code
/// issued for one intent can never complete another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeIntent {
    Register = 0,
    Reset = 1,
    ChangePassword = 2,
    DeleteAccount = 3,
}

impl CodeIntent {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(CodeIntent::Register),
            1 => Some(CodeIntent::Reset),
            2 => Some(CodeIntent::ChangePassword),
            3 => Some(CodeIntent::DeleteAccount),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "register" => Some(CodeIntent::Register),
            "reset" => Some(CodeIntent::Reset),
            "change-password" => Some(CodeIntent::ChangePassword),
            "delete-account" => Some(CodeIntent::DeleteAccount),
            _ => None,
        }
    }

    pub fn as_name(&self) -> &'static str {
        match self {
            CodeIntent::Register => "register",
            CodeIntent::Reset => "reset",
            CodeIntent::ChangePassword => "change-password",
            CodeIntent::DeleteAccount => "delete-account",
        }
    }
}

const CODE_DIGITS: u32 = 6;
const MAX_ATTEMPTS: i32 = 5;

/// One-shot link token, mailed to the user embedded in a URL. Redeeming it
/// once mints the numeric code the user types into the UI.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = one_shot_tokens)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(token))]
pub struct OneShotToken {
    pub token: String,
    pub email: String,
    pub intent: i32,
    pub code: Option<String>,
    pub used: bool,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = verification_codes)]
#[diesel(treat_none_as_null = true)]
pub struct VerificationCode {
    pub id: i64,
    pub email: String,
    pub code: String,
    pub intent: i32,
    pub attempts: i32,
    pub verified: bool,
    pub verified_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = verification_codes)]
struct NewVerificationCode {
    email: String,
    code: String,
    intent: i32,
    attempts: i32,
    verified: bool,
    verified_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    expires_at: NaiveDateTime,
}

pub struct RedeemedLink {
    pub code: String,
    pub email: String,
    pub intent: CodeIntent,
}

impl OneShotToken {
    pub async fn issue(email: &str, intent: CodeIntent, conn: &DbConn) -> ApiResult<Self> {
        let now = Utc::now().naive_utc();
        let token = Self {
            token: crypto::generate_token::<32>(),
            email: crate::util::normalize_email(email),
            intent: intent as i32,
            code: None,
            used: false,
            created_at: now,
            expires_at: now + Duration::seconds(CONFIG.verification_ttl_secs),
        };

        db_run! {conn: {
            diesel::insert_into(one_shot_tokens::table)
                .values(&token)
                .execute(conn)
                .map_res("Error saving one-shot token")?;
            Ok(token)
        }}
    }

    pub async fn find(token: &str, conn: &DbConn) -> Option<Self> {
        let token = token.to_string();
        db_run! {conn: {
            one_shot_tokens::table
                .filter(one_shot_tokens::token.eq(token))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Atomic redemption: the first caller flips `used` and receives the
    /// lazily minted numeric code; everyone after that gets TOKEN_USED.
    pub async fn redeem(token: &str, conn: &DbConn) -> ApiResult<RedeemedLink> {
        let now = Utc::now().naive_utc();

        let row = match Self::find(token, conn).await {
            Some(row) => row,
            None => err_code!("Unknown verification link", "INVALID_TOKEN", 400),
        };

        let intent = match CodeIntent::from_i32(row.intent) {
            Some(intent) => intent,
            None => err!("One-shot token carries an unknown intent"),
        };

        if row.expires_at < now {
            row.delete(conn).await.ok();
            err_code!("Verification link expired", "TOKEN_EXPIRED", 400);
        }

        if row.used {
            err_code!("Verification link already used", "TOKEN_USED", 400);
        }

        let code = crypto::generate_numeric_code(CODE_DIGITS)?;

        // Guarded update; a concurrent redemption loses the race and sees
        // zero affected rows.
        let token_owned = row.token.clone();
        let code_for_update = code.clone();
        let updated: usize = db_run! {conn: {
            diesel::update(
                one_shot_tokens::table
                    .filter(one_shot_tokens::token.eq(&token_owned))
                    .filter(one_shot_tokens::used.eq(false)),
            )
            .set((one_shot_tokens::used.eq(true), one_shot_tokens::code.eq(&code_for_update)))
            .execute(conn)
            .unwrap_or(0)
        }};

        if updated == 0 {
            err_code!("Verification link already used", "TOKEN_USED", 400);
        }

        VerificationCode::insert(&row.email, &code, intent, conn).await?;

        Ok(RedeemedLink {
            code,
            email: row.email,
            intent,
        })
    }

    pub async fn delete(&self, conn: &DbConn) -> EmptyResult {
        let token = self.token.clone();
        db_run! {conn: {
            diesel::delete(one_shot_tokens::table.filter(one_shot_tokens::token.eq(token)))
                .execute(conn)
                .map_res("Error deleting one-shot token")
        }}
    }

    pub async fn delete_by_email(email: &str, intent: Option<CodeIntent>, conn: &DbConn) -> EmptyResult {
        let email = crate::util::normalize_email(email);
        db_run! {conn: {
            match intent {
                Some(intent) => diesel::delete(
                    one_shot_tokens::table
                        .filter(one_shot_tokens::email.eq(email))
                        .filter(one_shot_tokens::intent.eq(intent as i32)),
                )
                .execute(conn)
                .map_res("Error deleting one-shot tokens"),
                None => diesel::delete(one_shot_tokens::table.filter(one_shot_tokens::email.eq(email)))
                    .execute(conn)
                    .map_res("Error deleting one-shot tokens"),
            }
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! {conn: {
            diesel::delete(one_shot_tokens::table.filter(one_shot_tokens::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging one-shot tokens")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired one-shot tokens: {e:#?}");
        }
    }
}

pub struct VerifyOutcome {
    pub intent: CodeIntent,
    pub already_verified: bool,
}

impl VerificationCode {
    async fn insert(email: &str, code: &str, intent: CodeIntent, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        let row = NewVerificationCode {
            email: email.to_string(),
            code: code.to_string(),
            intent: intent as i32,
            attempts: 0,
            verified: false,
            verified_at: None,
            created_at: now,
            expires_at: now + Duration::seconds(CONFIG.verification_ttl_secs),
        };

        db_run! {conn: {
            diesel::insert_into(verification_codes::table)
                .values(&row)
                .execute(conn)
                .map_res("Error saving verification code")
        }}
    }

    /// The latest outstanding code for this email (and intent, when given).
    async fn find_latest(email: &str, intent: Option<CodeIntent>, conn: &DbConn) -> Option<Self> {
        let email = crate::util::normalize_email(email);
        db_run! {conn: {
            match intent {
                Some(intent) => verification_codes::table
                    .filter(verification_codes::email.eq(email))
                    .filter(verification_codes::intent.eq(intent as i32))
                    .order(verification_codes::created_at.desc())
                    .first::<Self>(conn)
                    .ok(),
                None => verification_codes::table
                    .filter(verification_codes::email.eq(email))
                    .order(verification_codes::created_at.desc())
                    .first::<Self>(conn)
                    .ok(),
            }
        }}
    }

    async fn exists_for_code(code: &str, conn: &DbConn) -> bool {
        let code = code.to_string();
        db_run! {conn: {
            verification_codes::table
                .filter(verification_codes::code.eq(code))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
                > 0
        }}
    }

    /// Checks a typed-in code. Verified rows answer idempotently without
    /// touching the attempt counter; every other outcome consumes one
    /// attempt, and the row is dropped once the budget is spent.
    pub async fn verify(
        code: &str,
        email: &str,
        expected_intent: Option<CodeIntent>,
        conn: &DbConn,
    ) -> ApiResult<VerifyOutcome> {
        let now = Utc::now().naive_utc();

        let mut row = match Self::find_latest(email, expected_intent, conn).await {
            Some(row) => row,
            None => {
                // Distinguish a wrong mailbox from a wrong code, without
                // touching any other account's attempt budget.
                if Self::exists_for_code(code, conn).await {
                    err_code!("Code was issued for a different email", "EMAIL_MISMATCH", 400);
                }
                err_code!("Invalid verification code", "INVALID_CODE", 400);
            }
        };

        let intent = match CodeIntent::from_i32(row.intent) {
            Some(intent) => intent,
            None => err!("Verification code carries an unknown intent"),
        };

        if let Some(expected) = expected_intent {
            if expected != intent {
                err_code!("Code was issued for a different purpose", "TYPE_MISMATCH", 400);
            }
        }

        if row.expires_at < now {
            row.delete(conn).await.ok();
            err_code!("Verification code expired", "CODE_EXPIRED", 400);
        }

        if row.verified && crypto::ct_eq(&row.code, code) {
            return Ok(VerifyOutcome {
                intent,
                already_verified: true,
            });
        }

        row.attempts += 1;
        if row.attempts > MAX_ATTEMPTS {
            row.delete(conn).await.ok();
            err_code!("Too many attempts for this code", "TOO_MANY_ATTEMPTS", 429);
        }

        if !crypto::ct_eq(&row.code, code) {
            row.save_attempts(conn).await?;
            err_code!("Invalid verification code", "INVALID_CODE", 400);
        }

        row.verified = true;
        row.verified_at = Some(now);
        row.save(conn).await?;

        Ok(VerifyOutcome {
            intent,
            already_verified: false,
        })
    }

    /// Enforces the verified precondition and deletes the row. The business
    /// step that the code guarded runs in the caller afterwards.
    pub async fn consume(code: &str, email: &str, intent: CodeIntent, conn: &DbConn) -> ApiResult<()> {
        let row = match Self::find_latest(email, Some(intent), conn).await {
            Some(row) => row,
            None => err_code!("Invalid verification code", "INVALID_CODE", 400),
        };

        if !crypto::ct_eq(&row.code, code) {
            err_code!("Invalid verification code", "INVALID_CODE", 400);
        }

        if !row.verified {
            err_code!("Code has not been verified", "CODE_NOT_VERIFIED", 400);
        }

        row.delete(conn).await
    }

    /// Revocation path; kills outstanding codes and links, e.g. reset codes
    /// after a password change.
    pub async fn invalidate_by_email(email: &str, intent: Option<CodeIntent>, conn: &DbConn) -> EmptyResult {
        let normalized = crate::util::normalize_email(email);
        db_run! {conn: {
            match intent {
                Some(intent) => diesel::delete(
                    verification_codes::table
                        .filter(verification_codes::email.eq(&normalized))
                        .filter(verification_codes::intent.eq(intent as i32)),
                )
                .execute(conn)
                .map_res("Error deleting verification codes"),
                None => diesel::delete(verification_codes::table.filter(verification_codes::email.eq(&normalized)))
                    .execute(conn)
                    .map_res("Error deleting verification codes"),
            }
        }}?;
        OneShotToken::delete_by_email(email, intent, conn).await
    }

    async fn save_attempts(&self, conn: &DbConn) -> EmptyResult {
        let id = self.id;
        let attempts = self.attempts;
        db_run! {conn: {
            diesel::update(verification_codes::table.filter(verification_codes::id.eq(id)))
                .set(verification_codes::attempts.eq(attempts))
                .execute(conn)
                .map_res("Error saving verification code attempts")
        }}
    }

    async fn save(&self, conn: &DbConn) -> EmptyResult {
        let id = self.id;
        db_run! {conn: {
            diesel::update(verification_codes::table.filter(verification_codes::id.eq(id)))
                .set((
                    verification_codes::attempts.eq(self.attempts),
                    verification_codes::verified.eq(self.verified),
                    verification_codes::verified_at.eq(self.verified_at),
                ))
                .execute(conn)
                .map_res("Error saving verification code")
        }}
    }

    async fn delete(&self, conn: &DbConn) -> EmptyResult {
        let id = self.id;
        db_run! {conn: {
            diesel::delete(verification_codes::table.filter(verification_codes::id.eq(id)))
                .execute(conn)
                .map_res("Error deleting verification code")
        }}
    }

    pub async fn purge_expired(conn: &DbConn) {
        let now = Utc::now().naive_utc();
        let res: EmptyResult = db_run! {conn: {
            diesel::delete(verification_codes::table.filter(verification_codes::expires_at.lt(now)))
                .execute(conn)
                .map_res("Error purging verification codes")
        }};
        if let Err(e) = res {
            warn!("Failed to purge expired verification codes: {e:#?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_names_round_trip() {
        for intent in [CodeIntent::Register, CodeIntent::Reset, CodeIntent::ChangePassword, CodeIntent::DeleteAccount] {
            assert_eq!(CodeIntent::from_name(intent.as_name()), Some(intent));
        }
        assert_eq!(CodeIntent::from_name("unknown"), None);
    }

    #[test]
    fn test_intent_discriminants_are_stable() {
        // Stored in the intent column; renumbering would corrupt live data.
        assert_eq!(CodeIntent::Register as i32, 0);
        assert_eq!(CodeIntent::Reset as i32, 1);
        assert_eq!(CodeIntent::ChangePassword as i32, 2);
        assert_eq!(CodeIntent::DeleteAccount as i32, 3);
    }

    #[test]
    fn test_attempt_budget_boundary() {
        // 5 failed attempts keep the row, the 6th crosses the budget.
        let mut attempts = 0;
        for _ in 0..MAX_ATTEMPTS {
            attempts += 1;
            assert!(attempts <= MAX_ATTEMPTS);
        }
        attempts += 1;
        assert!(attempts > MAX_ATTEMPTS);
    }
}
