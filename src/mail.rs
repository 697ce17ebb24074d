use std::env::consts::EXE_SUFFIX;
use std::str::FromStr;

use once_cell::sync::Lazy;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use handlebars::Handlebars;

use lettre::{
    message::{Mailbox, Message},
    transport::smtp::authentication::{Credentials, Mechanism as SmtpAuthMechanism},
    transport::smtp::client::{Tls, TlsParameters},
    Address, AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};

use crate::{
    api::EmptyResult,
    db::models::CodeIntent,
    error::Error,
    CONFIG,
};

static TEMPLATES: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);

    macro_rules! reg {
        ($name:expr) => {
            hb.register_template_string($name, include_str!(concat!("static/templates/", $name, ".hbs")))
                .expect("Valid email template");
        };
    }

    reg!("email_verify");
    reg!("email_password_changed");
    reg!("email_account_deleted");

    hb
});

fn sendmail_transport() -> AsyncSendmailTransport<Tokio1Executor> {
    if let Some(ref command) = CONFIG.sendmail_command {
        AsyncSendmailTransport::new_with_command(command)
    } else {
        AsyncSendmailTransport::new_with_command(format!("sendmail{EXE_SUFFIX}"))
    }
}

fn smtp_transport() -> Result<AsyncSmtpTransport<Tokio1Executor>, Error> {
    use std::time::Duration;
    let Some(ref host) = CONFIG.smtp_host else {
        err!("SMTP host is not configured");
    };

    let smtp_client = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
        .port(CONFIG.smtp_port)
        .timeout(Some(Duration::from_secs(CONFIG.smtp_timeout)));

    // Determine security
    let smtp_client = if CONFIG.smtp_security != "off" {
        let tls_parameters = TlsParameters::new(host.clone())?;
        if CONFIG.smtp_security == "force_tls" {
            smtp_client.tls(Tls::Wrapper(tls_parameters))
        } else {
            smtp_client.tls(Tls::Required(tls_parameters))
        }
    } else {
        smtp_client
    };

    let smtp_client = match (&CONFIG.smtp_username, &CONFIG.smtp_password) {
        (Some(user), Some(pass)) => smtp_client
            .credentials(Credentials::new(user.clone(), pass.clone()))
            .authentication(vec![SmtpAuthMechanism::Plain, SmtpAuthMechanism::Login]),
        _ => smtp_client,
    };

    Ok(smtp_client.build())
}

/// Splits the rendered template into the subject above the marker and the
/// body below it.
fn render_template(name: &str, data: &serde_json::Value) -> Result<(String, String), Error> {
    let rendered = TEMPLATES.render(name, data)?;
    match rendered.split_once("<!---------------->") {
        Some((subject, body)) => Ok((subject.trim().to_string(), body.trim().to_string())),
        None => err!("Email template is missing a subject marker"),
    }
}

fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, Error> {
    Ok(Mailbox::new(name.map(|n| n.to_string()), Address::from_str(address)?))
}

async fn send_email(to: &str, subject: &str, body: String) -> EmptyResult {
    if !CONFIG.mail_enabled() {
        err_code!("Email is not configured on this server", "EMAIL_DISABLED", 503);
    }

    let message = Message::builder()
        .from(mailbox(&CONFIG.smtp_from, Some(&CONFIG.smtp_from_name))?)
        .to(mailbox(to, None)?)
        .subject(subject)
        .body(body)?;

    if CONFIG.use_sendmail {
        sendmail_transport().send(message).await.map_err(|e| {
            error!("Failed to send email via sendmail: {e:?}");
            Error::new("Failed to send email", e.to_string())
        })?;
    } else {
        smtp_transport()?.send(message).await.map_err(|e| {
            error!("Failed to send email via SMTP: {e:?}");
            Error::new("Failed to send email", e.to_string())
        })?;
    }

    Ok(())
}

fn intent_action(intent: CodeIntent) -> &'static str {
    match intent {
        CodeIntent::Register => "create an account",
        CodeIntent::Reset => "reset a password",
        CodeIntent::ChangePassword => "change a password",
        CodeIntent::DeleteAccount => "delete an account",
    }
}

/// Mails the one-shot verification link for the given intent.
pub async fn send_verification_link(email: &str, intent: CodeIntent, token: &str) -> EmptyResult {
    let encoded_token: String = percent_encode(token.as_bytes(), NON_ALPHANUMERIC).to_string();
    let url = format!("{}/account/verify?token={}", CONFIG.domain, encoded_token);

    let (subject, body) = render_template(
        "email_verify",
        &json!({
            "domain": CONFIG.domain,
            "action": intent_action(intent),
            "url": url,
            "ttl_minutes": CONFIG.verification_ttl_secs / 60,
        }),
    )?;

    send_email(email, &subject, body).await
}

pub async fn send_password_changed(email: &str) -> EmptyResult {
    let (subject, body) = render_template(
        "email_password_changed",
        &json!({
            "domain": CONFIG.domain,
        }),
    )?;

    send_email(email, &subject, body).await
}

pub async fn send_account_deleted(email: &str) -> EmptyResult {
    let (subject, body) = render_template(
        "email_account_deleted",
        &json!({
            "domain": CONFIG.domain,
        }),
    )?;

    send_email(email, &subject, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_render_with_subject_and_body() {
        let (subject, body) = render_template(
            "email_verify",
            &json!({
                "domain": "https://id.example.com",
                "action": "create an account",
                "url": "https://id.example.com/account/verify?token=abc",
                "ttl_minutes": 5,
            }),
        )
        .unwrap();
        assert_eq!(subject, "Verify your email address");
        assert!(body.contains("https://id.example.com/account/verify?token=abc"));
        assert!(body.contains("5 minutes"));
    }

    #[test]
    fn test_unknown_template_fails() {
        assert!(render_template("missing", &json!({})).is_err());
    }
}
