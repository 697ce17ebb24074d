//
// Outbound HTTP
//
// Every external call (Microsoft Graph, captcha verification) goes through
// one client with connect and request deadlines, so a stalled upstream can
// never pin a request handler.
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{Client, ClientBuilder, Method, RequestBuilder};

use crate::error::Error;

static INSTANCE: Lazy<Client> =
    Lazy::new(|| get_reqwest_client_builder().build().expect("Failed to build reqwest client"));

pub fn get_reqwest_client_builder() -> ClientBuilder {
    Client::builder()
        .user_agent(format!("Authgate/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(3))
}

pub fn make_http_request(method: Method, url: &str) -> Result<RequestBuilder, Error> {
    if url::Url::parse(url).is_err() {
        err!("Invalid URL for outbound request");
    }

    Ok(INSTANCE.request(method, url))
}
