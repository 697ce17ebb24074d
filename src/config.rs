use std::process::exit;

use once_cell::sync::Lazy;

use crate::util::{get_env, get_env_bool};

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(12)
    })
});

/// Session bearers are valid for 60 days unless configured otherwise.
pub const DEFAULT_SESSION_LIFETIME_SECS: i64 = 60 * 86_400;
const MIN_SESSION_LIFETIME_SECS: i64 = 60;
const MAX_SESSION_LIFETIME_SECS: i64 = DEFAULT_SESSION_LIFETIME_SECS;

#[derive(Debug)]
pub struct Config {
    pub data_folder: String,

    pub database_url: String,
    pub database_max_conns: u32,
    pub database_timeout: u64,
    pub database_idle_timeout: u64,
    pub database_conn_init: String,

    /// Public origin of this server, e.g. `https://id.example.com`. Used for
    /// cookies, mailed links and the OAuth/SSO redirect URLs.
    pub domain: String,
    pub domain_set: bool,

    pub session_lifetime_secs: i64,
    pub session_secret_file: String,

    pub user_cache_capacity: u64,
    pub user_cache_ttl_secs: u64,

    // Rate limit buckets, expressed as seconds-per-token plus a burst size.
    // The defaults come out to 5/min, 3/min, 3/min and 10/min.
    pub login_ratelimit_seconds: u64,
    pub login_ratelimit_max_burst: u32,
    pub register_ratelimit_seconds: u64,
    pub register_ratelimit_max_burst: u32,
    pub reset_ratelimit_seconds: u64,
    pub reset_ratelimit_max_burst: u32,
    pub token_ratelimit_seconds: u64,
    pub token_ratelimit_max_burst: u32,

    pub ip_header: String,

    pub log_level: String,
    pub log_file: Option<String>,
    pub log_timestamp_format: String,
    pub use_syslog: bool,
    pub extended_logging: bool,

    // SMTP. All optional; the mail paths degrade with EMAIL_DISABLED when
    // no host is configured.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_security: String,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: String,
    pub smtp_from_name: String,
    pub smtp_timeout: u64,
    pub use_sendmail: bool,
    pub sendmail_command: Option<String>,

    // Microsoft federation.
    pub microsoft_client_id: Option<String>,
    pub microsoft_client_secret: Option<String>,
    pub microsoft_tenant: String,
    pub sso_client_cache_expiration: u64,

    // Avatar object storage. When unset, avatars fall back to inline data URLs.
    pub storage_root: Option<String>,
    pub storage_public_url: Option<String>,

    // Captcha verification. When unset, captcha checks pass.
    pub captcha_verify_url: Option<String>,
    pub captcha_secret: Option<String>,

    pub qr_token_ttl_secs: i64,
    pub verification_ttl_secs: i64,

    /// Registering with this email yields the super-admin role.
    pub super_admin_email: Option<String>,

    pub purge_schedule: String,
    pub log_retention_schedule: String,
    pub log_retention_days: i64,
}

impl Config {
    pub fn load() -> Result<Self, crate::error::Error> {
        // Loading from .env is optional; plain environment variables win.
        dotenvy::dotenv().ok();

        let data_folder = get_env("DATA_FOLDER").unwrap_or_else(|| String::from("data"));

        let domain: Option<String> = get_env("DOMAIN");
        let domain_set = domain.is_some();
        let domain = domain.unwrap_or_else(|| String::from("http://localhost:8000")).trim_end_matches('/').to_string();

        let session_lifetime_secs = get_env("SESSION_LIFETIME_SECS").unwrap_or(DEFAULT_SESSION_LIFETIME_SECS);

        let cfg = Config {
            database_url: get_env("DATABASE_URL").unwrap_or_else(|| format!("{data_folder}/authgate.sqlite3")),
            database_max_conns: get_env("DATABASE_MAX_CONNS").unwrap_or(10),
            database_timeout: get_env("DATABASE_TIMEOUT").unwrap_or(30),
            database_idle_timeout: get_env("DATABASE_IDLE_TIMEOUT").unwrap_or(600),
            database_conn_init: get_env("DATABASE_CONN_INIT").unwrap_or_default(),

            domain,
            domain_set,

            session_lifetime_secs,
            session_secret_file: get_env("SESSION_SECRET_FILE")
                .unwrap_or_else(|| format!("{data_folder}/session_secret")),

            user_cache_capacity: get_env("USER_CACHE_CAPACITY").unwrap_or(1000),
            user_cache_ttl_secs: get_env("USER_CACHE_TTL_SECS").unwrap_or(900),

            login_ratelimit_seconds: get_env("LOGIN_RATELIMIT_SECONDS").unwrap_or(12),
            login_ratelimit_max_burst: get_env("LOGIN_RATELIMIT_MAX_BURST").unwrap_or(5),
            register_ratelimit_seconds: get_env("REGISTER_RATELIMIT_SECONDS").unwrap_or(20),
            register_ratelimit_max_burst: get_env("REGISTER_RATELIMIT_MAX_BURST").unwrap_or(3),
            reset_ratelimit_seconds: get_env("RESET_RATELIMIT_SECONDS").unwrap_or(20),
            reset_ratelimit_max_burst: get_env("RESET_RATELIMIT_MAX_BURST").unwrap_or(3),
            token_ratelimit_seconds: get_env("TOKEN_RATELIMIT_SECONDS").unwrap_or(6),
            token_ratelimit_max_burst: get_env("TOKEN_RATELIMIT_MAX_BURST").unwrap_or(10),

            ip_header: get_env("IP_HEADER").unwrap_or_else(|| String::from("X-Real-IP")),

            log_level: get_env("LOG_LEVEL").unwrap_or_else(|| String::from("info")),
            log_file: get_env("LOG_FILE"),
            log_timestamp_format: get_env("LOG_TIMESTAMP_FORMAT")
                .unwrap_or_else(|| String::from("%Y-%m-%d %H:%M:%S.%3f")),
            use_syslog: get_env_bool("USE_SYSLOG").unwrap_or(false),
            extended_logging: get_env_bool("EXTENDED_LOGGING").unwrap_or(true),

            smtp_host: get_env("SMTP_HOST"),
            smtp_port: get_env("SMTP_PORT").unwrap_or(587),
            smtp_security: get_env("SMTP_SECURITY").unwrap_or_else(|| String::from("starttls")),
            smtp_username: get_env("SMTP_USERNAME"),
            smtp_password: get_env("SMTP_PASSWORD"),
            smtp_from: get_env("SMTP_FROM").unwrap_or_default(),
            smtp_from_name: get_env("SMTP_FROM_NAME").unwrap_or_else(|| String::from("Authgate")),
            smtp_timeout: get_env("SMTP_TIMEOUT").unwrap_or(15),
            use_sendmail: get_env_bool("USE_SENDMAIL").unwrap_or(false),
            sendmail_command: get_env("SENDMAIL_COMMAND"),

            microsoft_client_id: get_env("MICROSOFT_CLIENT_ID"),
            microsoft_client_secret: get_env("MICROSOFT_CLIENT_SECRET"),
            microsoft_tenant: get_env("MICROSOFT_TENANT").unwrap_or_else(|| String::from("common")),
            sso_client_cache_expiration: get_env("SSO_CLIENT_CACHE_EXPIRATION").unwrap_or(300),

            storage_root: get_env("STORAGE_ROOT"),
            storage_public_url: get_env::<String>("STORAGE_PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),

            captcha_verify_url: get_env("CAPTCHA_VERIFY_URL"),
            captcha_secret: get_env("CAPTCHA_SECRET"),

            qr_token_ttl_secs: get_env("QR_TOKEN_TTL_SECS").unwrap_or(300),
            verification_ttl_secs: get_env("VERIFICATION_TTL_SECS").unwrap_or(300),

            super_admin_email: get_env::<String>("SUPER_ADMIN_EMAIL").map(|e| e.to_lowercase()),

            purge_schedule: get_env("PURGE_SCHEDULE").unwrap_or_else(|| String::from("30 */10 * * * *")),
            log_retention_schedule: get_env("LOG_RETENTION_SCHEDULE").unwrap_or_else(|| String::from("0 40 3 * * *")),
            log_retention_days: get_env("LOG_RETENTION_DAYS").unwrap_or(180),

            data_folder,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), crate::error::Error> {
        if !(MIN_SESSION_LIFETIME_SECS..=MAX_SESSION_LIFETIME_SECS).contains(&self.session_lifetime_secs) {
            err!(format!(
                "SESSION_LIFETIME_SECS must be between {MIN_SESSION_LIFETIME_SECS} and {MAX_SESSION_LIFETIME_SECS}"
            ));
        }

        if self.login_ratelimit_seconds == 0
            || self.login_ratelimit_max_burst == 0
            || self.register_ratelimit_seconds == 0
            || self.register_ratelimit_max_burst == 0
            || self.reset_ratelimit_seconds == 0
            || self.reset_ratelimit_max_burst == 0
            || self.token_ratelimit_seconds == 0
            || self.token_ratelimit_max_burst == 0
        {
            err!("Rate limit seconds and bursts cannot be zero");
        }

        if self.sso_enabled() && !self.domain_set {
            err!("DOMAIN must be set when the Microsoft federation is configured");
        }

        if self.smtp_host.is_some() {
            if self.smtp_from.is_empty() {
                err!("SMTP_FROM is required when SMTP_HOST is set");
            }
            if !self.smtp_from.contains('@') {
                err!("SMTP_FROM does not contain a mail address");
            }
        }

        if self.qr_token_ttl_secs < 30 {
            err!("QR_TOKEN_TTL_SECS is too short to complete a scan");
        }

        Ok(())
    }

    pub fn mail_enabled(&self) -> bool {
        self.smtp_host.is_some() || self.use_sendmail
    }

    pub fn sso_enabled(&self) -> bool {
        self.microsoft_client_id.is_some() && self.microsoft_client_secret.is_some()
    }

    pub fn storage_enabled(&self) -> bool {
        self.storage_root.is_some()
    }

    pub fn captcha_enabled(&self) -> bool {
        self.captcha_secret.is_some() && self.captcha_verify_url.is_some()
    }

    pub fn is_https(&self) -> bool {
        self.domain.starts_with("https://")
    }

    /// Scheme + host (+ port) of the configured domain.
    pub fn domain_origin(&self) -> String {
        url::Url::parse(&self.domain)
            .ok()
            .and_then(|u| match (u.scheme(), u.host_str(), u.port()) {
                (scheme, Some(host), Some(port)) => Some(format!("{scheme}://{host}:{port}")),
                (scheme, Some(host), None) => Some(format!("{scheme}://{host}")),
                _ => None,
            })
            .unwrap_or_default()
    }
}
