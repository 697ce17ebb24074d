//
// Captcha verification (Turnstile-style POST contract)
//
// The provider protocol is an external collaborator; all we rely on is a
// form POST of (secret, response, remoteip) answered with {"success": bool}.
// An unconfigured captcha passes every check so the server can run without
// the provider.
use std::net::IpAddr;

use crate::api::EmptyResult;
use crate::http_client::make_http_request;
use crate::CONFIG;

#[derive(Deserialize)]
struct CaptchaResponse {
    success: bool,
}

pub async fn verify_captcha(response: Option<&str>, ip: &IpAddr) -> EmptyResult {
    let (Some(verify_url), Some(secret)) = (CONFIG.captcha_verify_url.as_deref(), CONFIG.captcha_secret.as_deref())
    else {
        return Ok(());
    };

    let token = match response {
        Some(token) if !token.is_empty() => token,
        _ => err_code!("Captcha response missing", "CAPTCHA_FAILED", 400),
    };

    let form = [("secret", secret), ("response", token), ("remoteip", &ip.to_string())];

    let result = match make_http_request(reqwest::Method::POST, verify_url)?.form(&form).send().await {
        Ok(res) => res,
        Err(e) => {
            // Provider trouble is a transient infrastructure failure, not a
            // wrong answer from the user.
            error!("Captcha verification request failed: {e}");
            err_code!("Captcha provider unreachable", "INTERNAL_ERROR", 502);
        }
    };

    let parsed: CaptchaResponse = match result.json().await {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Captcha verification response unreadable: {e}");
            err_code!("Captcha provider unreachable", "INTERNAL_ERROR", 502);
        }
    };

    if !parsed.success {
        err_code!("Captcha verification failed", "CAPTCHA_FAILED", 400);
    }

    Ok(())
}
