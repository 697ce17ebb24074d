//
// Env and retry helpers
//
use std::str::FromStr;

pub fn get_env_str_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) => Some(v),
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    get_env_str_value(key).and_then(|v| v.parse::<V>().ok())
}

pub const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
pub const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

pub fn get_env_bool(key: &str) -> Option<bool> {
    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

pub fn file_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

/// Retries a closure on failure, waiting between tries. Used for database
/// writes that can hit transient lock errors on SQLite.
pub fn retry<F, T, E>(mut func: F, max_tries: u32) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            err @ Err(_) => {
                tries += 1;

                if tries >= max_tries {
                    return err;
                }

                std::thread::sleep(std::time::Duration::from_millis(500));
            }
        }
    }
}

pub fn format_naive_datetime(dt: &chrono::NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Case-folds an email address the way the store indexes it.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    email_address::EmailAddress::is_valid(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_returns_first_success() {
        let mut calls = 0;
        let res: Result<u32, ()> = retry(
            || {
                calls += 1;
                if calls < 3 {
                    Err(())
                } else {
                    Ok(42)
                }
            },
            10,
        );
        assert_eq!(res, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_tries() {
        let mut calls = 0;
        let res: Result<(), u32> = retry(
            || {
                calls += 1;
                Err(calls)
            },
            3,
        );
        assert_eq!(res, Err(3));
    }

    #[test]
    fn test_normalize_email_case_folds_and_trims() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("user@example.com"));
        assert!(!is_valid_email("not-an-address"));
        assert!(!is_valid_email(""));
    }
}
