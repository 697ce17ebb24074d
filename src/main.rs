#![recursion_limit = "512"]

#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

use std::{process::exit, str::FromStr, thread};

#[macro_use]
mod error;

mod api;
mod auth;
mod cache;
mod captcha;
mod config;
mod crypto;
mod db;
mod http_client;
mod mail;
mod oauth;
mod ratelimit;
mod sso;
mod storage;
mod util;

pub use config::CONFIG;
pub use error::Error;

use crate::db::models::{AccessToken, AuthorizationCode, OneShotToken, QrLoginToken, RefreshToken, UserLog, VerificationCode};

fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    init_logging()?;
    check_data_folder();

    // Fail fast on a broken or unwritable session secret.
    auth::load_keys();

    let pool = create_db_pool();
    db::set_pool(pool.clone());
    schedule_jobs(pool.clone());

    launch_rocket(pool) // Blocks until stopped
}

const HELP: &str = "\
Authgate - a self-hosted identity provider and OAuth 2.0 authorization server

USAGE:
    authgate

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version
";

pub fn version() -> &'static str {
    option_env!("AG_VERSION").unwrap_or("(unknown version)")
}

fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("authgate {}", version());
        exit(0);
    }
}

fn launch_info() {
    println!("Starting Authgate {}", version());
}

fn init_logging() -> Result<(), Error> {
    let log_level = log::LevelFilter::from_str(&CONFIG.log_level)
        .map_err(|_| Error::new("Invalid LOG_LEVEL", format!("LOG_LEVEL `{}` is not valid", CONFIG.log_level)))?;

    let mut logger = fern::Dispatch::new()
        .level(log_level)
        // Hide unknown certificate errors if they are not specifically asked for
        .level_for("rustls::session", log::LevelFilter::Off)
        // Hide failed to close stream messages
        .level_for("hyper::server", log::LevelFilter::Warn)
        // Silence Rocket's launch chatter unless asked for
        .level_for("rocket::launch", log::LevelFilter::Error)
        .level_for("rocket::launch_", log::LevelFilter::Error)
        .level_for("_", log::LevelFilter::Warn)
        .chain(std::io::stdout());

    if CONFIG.extended_logging {
        logger = logger.format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&CONFIG.log_timestamp_format),
                record.target(),
                record.level(),
                message
            ))
        });
    }

    if let Some(ref log_file) = CONFIG.log_file {
        logger = logger.chain(fern::log_file(log_file)?);
    }

    #[cfg(unix)]
    {
        if CONFIG.use_syslog {
            logger = chain_syslog(logger);
        }
    }

    logger.apply().map_err(|e| Error::new("Failed to initialize logging", e.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn chain_syslog(logger: fern::Dispatch) -> fern::Dispatch {
    let syslog_fmt = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: "authgate".into(),
        pid: 0,
    };

    match syslog::unix(syslog_fmt) {
        Ok(sl) => logger.chain(sl),
        Err(e) => {
            error!("Unable to connect to syslog: {e:?}");
            logger
        }
    }
}

fn check_data_folder() {
    let data_folder = &CONFIG.data_folder;
    if let Err(e) = std::fs::create_dir_all(data_folder) {
        error!("Could not create data folder '{data_folder}': {e:?}");
        exit(1);
    }
}

fn create_db_pool() -> db::DbPool {
    match db::DbPool::from_config() {
        Ok(p) => p,
        Err(e) => {
            error!("Error creating database pool: {e:#?}");
            exit(1);
        }
    }
}

/// Purges every expired short-lived row. Each run is independent; one
/// failing table never stops the others.
async fn purge_expired(pool: db::DbPool) {
    debug!("Purging expired tokens and codes");
    match pool.get().await {
        Ok(conn) => {
            OneShotToken::purge_expired(&conn).await;
            VerificationCode::purge_expired(&conn).await;
            AuthorizationCode::purge_expired(&conn).await;
            AccessToken::purge_expired(&conn).await;
            RefreshToken::purge_expired(&conn).await;
            QrLoginToken::purge_expired(&conn).await;
        }
        Err(e) => {
            error!("Failed to get DB connection while purging expired rows: {e:#?}");
        }
    }
}

/// Drops user-log rows past the retention window.
async fn prune_user_logs(pool: db::DbPool) {
    debug!("Pruning old user logs");
    match pool.get().await {
        Ok(conn) => UserLog::prune_old(CONFIG.log_retention_days, &conn).await,
        Err(e) => {
            error!("Failed to get DB connection while pruning user logs: {e:#?}");
        }
    }
}

fn schedule_jobs(pool: db::DbPool) {
    let runtime = tokio::runtime::Runtime::new().expect("Unable to create a tokio runtime for the job scheduler");

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};
            let _runtime_guard = runtime.enter();

            let mut sched = JobScheduler::new();

            // Tasks spawn onto the runtime; a panicking tick dies inside its
            // JoinHandle and the scheduler simply reaches the next tick.
            match CONFIG.purge_schedule.parse() {
                Ok(schedule) => {
                    sched.add(Job::new(schedule, || {
                        runtime.spawn(purge_expired(pool.clone()));
                    }));
                }
                Err(e) => error!("PURGE_SCHEDULE is not a valid cron expression: {e}"),
            }

            match CONFIG.log_retention_schedule.parse() {
                Ok(schedule) => {
                    sched.add(Job::new(schedule, || {
                        runtime.spawn(prune_user_logs(pool.clone()));
                    }));
                }
                Err(e) => error!("LOG_RETENTION_SCHEDULE is not a valid cron expression: {e}"),
            }

            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(std::time::Duration::from_millis(30_000)));
            }
        })
        .expect("Error spawning job scheduler thread");
}

fn launch_rocket(pool: db::DbPool) -> Result<(), Error> {
    let runtime = tokio::runtime::Runtime::new().expect("Unable to create a tokio runtime for the Rocket server");
    runtime.block_on(async move {
        use rocket::data::{Limits, ToByteUnit};
        use rocket::fairing::AdHoc;

        // Request body caps: JSON APIs are small; only avatar uploads get room.
        let limits = Limits::default()
            .limit("json", 64.kibibytes())
            .limit("form", 64.kibibytes())
            .limit("bytes", 5.mebibytes());

        let config_figment = rocket::Config::figment().merge(("limits", limits));

        let instance = rocket::custom(config_figment)
            .mount("/api", api::accounts_routes())
            .mount("/oauth", api::oauth_routes())
            .mount("/sso", api::sso_routes())
            .mount("/qr-login", api::qr_login_routes())
            .mount("/ws", api::notifications_routes())
            .mount("/admin", api::admin_routes())
            .register("/", api::catchers())
            .manage(pool)
            .attach(AdHoc::on_liftoff("WebSocket sweeper", |rocket| {
                Box::pin(async move {
                    let shutdown = rocket.shutdown();
                    tokio::spawn(api::start_sweeper(shutdown));
                })
            }))
            .ignite()
            .await?;

        let shutdown = instance.shutdown();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
            info!("Exiting Authgate!");
            shutdown.notify();
        });

        let _unused = instance.launch().await?;

        // Stopped accepting requests; drain live WebSockets, then the pool and
        // scheduler die with the process.
        api::ws_shutdown().await;

        info!("Authgate process exited!");
        Ok(())
    })
}
