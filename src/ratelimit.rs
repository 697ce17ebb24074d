use once_cell::sync::Lazy;
use std::{net::IpAddr, num::NonZeroU32, time::Duration};

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};

use crate::{error::Error, CONFIG};

type Limiter<T = IpAddr> = RateLimiter<T, DashMapStateStore<T>, DefaultClock>;

static LIMITER_LOGIN: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.login_ratelimit_seconds);
    let burst = NonZeroU32::new(CONFIG.login_ratelimit_max_burst).expect("Non-zero login ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero login ratelimit seconds").allow_burst(burst))
});

static LIMITER_REGISTER: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.register_ratelimit_seconds);
    let burst = NonZeroU32::new(CONFIG.register_ratelimit_max_burst).expect("Non-zero register ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero register ratelimit seconds").allow_burst(burst))
});

static LIMITER_RESET: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.reset_ratelimit_seconds);
    let burst = NonZeroU32::new(CONFIG.reset_ratelimit_max_burst).expect("Non-zero reset ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero reset ratelimit seconds").allow_burst(burst))
});

static LIMITER_TOKEN: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.token_ratelimit_seconds);
    let burst = NonZeroU32::new(CONFIG.token_ratelimit_max_burst).expect("Non-zero token ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero token ratelimit seconds").allow_burst(burst))
});

fn check(limiter: &Limiter, ip: &IpAddr, what: &str) -> Result<(), Error> {
    match limiter.check_key(ip) {
        Ok(_) => Ok(()),
        Err(_) => err_code!(format!("Too many {what} requests"), "RATE_LIMITED", 429),
    }
}

pub fn check_limit_login(ip: &IpAddr) -> Result<(), Error> {
    check(&LIMITER_LOGIN, ip, "login")
}

pub fn check_limit_register(ip: &IpAddr) -> Result<(), Error> {
    check(&LIMITER_REGISTER, ip, "registration")
}

pub fn check_limit_reset(ip: &IpAddr) -> Result<(), Error> {
    check(&LIMITER_RESET, ip, "password reset")
}

pub fn check_limit_oauth_token(ip: &IpAddr) -> Result<(), Error> {
    check(&LIMITER_TOKEN, ip, "token")
}
