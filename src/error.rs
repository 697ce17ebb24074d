//
// Error generator macro
//
// Every variant wraps the underlying cause. The struct around it carries the
// user visible message, the stable API error code and the HTTP status the
// responder will use. Domain code never formats HTTP itself; it attaches a
// code with `err_code!` and the responder does the rest.
macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $show_cause:expr ),+ $(,)? ) => {
        #[derive(Debug)]
        enum ErrorKind { $( $name($ty) ),+ }

        #[derive(Debug)]
        pub struct Error {
            message: String,
            error_code: &'static str,
            status: u16,
            kind: ErrorKind,
        }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error {
                    message: String::from(stringify!($name)),
                    error_code: "INTERNAL_ERROR",
                    status: 500,
                    kind: ErrorKind::$name(err),
                }
            }
        })+

        impl Error {
            fn log_cause(&self) {
                match &self.kind {$(
                    ErrorKind::$name(e) => {
                        if $show_cause {
                            error!("[CAUSE] {e:?}");
                        }
                    }
                ),+}
            }
        }
    };
}

use diesel::r2d2::PoolError as R2d2Error;
use diesel::result::Error as DieselError;
use diesel::ConnectionError as DieselConError;
use handlebars::RenderError as HbError;
use jsonwebtoken::errors::Error as JwtError;
use lettre::address::AddressError as AddrError;
use lettre::error::Error as LettreError;
use lettre::transport::smtp::Error as SmtpError;
use opendal::Error as StorageError;
use reqwest::Error as ReqError;
use rocket::error::Error as RocketError;
use serde_json::Error as SerdeError;
use std::io::Error as IoError;

make_error! {
    Simple(String):        false,
    Db(DieselError):       true,
    DbConnection(DieselConError): true,
    Pool(R2d2Error):       true,
    Serde(SerdeError):     true,
    Jwt(JwtError):         false,
    Smtp(SmtpError):       true,
    Lettre(LettreError):   true,
    Address(AddrError):    true,
    Template(HbError):     true,
    Http(ReqError):        true,
    Io(IoError):           true,
    Hash(bcrypt::BcryptError): true,
    Storage(StorageError): true,
    Rocket(RocketError):   true,
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        Error {
            message: usr_msg.into(),
            error_code: "INTERNAL_ERROR",
            status: 400,
            kind: ErrorKind::Simple(log_msg.into()),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: &'static str, status: u16) -> Self {
        self.error_code = code;
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    pub fn error_code(&self) -> &'static str {
        self.error_code
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl MapResult<()> for diesel::result::QueryResult<usize> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.and(Ok(())).map_err(Error::from).map_err(|e| e.with_msg(msg))
    }
}

impl<T> MapResult<T> for Option<T> {
    fn map_res(self, msg: &str) -> Result<T, Error> {
        match self {
            Some(v) => Ok(v),
            None => Err(Error::new(msg, msg)),
        }
    }
}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};

impl Responder<'_, 'static> for Error {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        if self.status >= 500 {
            error!("{}", self.message);
        } else {
            warn!("{}", self.message);
        }
        self.log_cause();

        let body = json!({
            "success": false,
            "errorCode": self.error_code,
        })
        .to_string();

        Response::build()
            .status(Status::new(self.status))
            .header(ContentType::JSON)
            .sized_body(Some(body.len()), Cursor::new(body))
            .ok()
    }
}

///
/// Error return macros
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

/// Returns an error carrying a stable API error code and HTTP status.
#[macro_export]
macro_rules! err_code {
    ($msg:expr, $code:expr, $status:expr) => {{
        return Err($crate::error::Error::new($msg, $msg).with_code($code, $status));
    }};
    ($usr_msg:expr, $log_value:expr, $code:expr, $status:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value).with_code($code, $status));
    }};
}

/// Aborts a request guard with the given status (401 if omitted).
#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        log::warn!("Request guard failed: {}", $expr);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $expr));
    }};
    ($expr:expr, $status:expr) => {{
        log::warn!("Request guard failed: {}", $expr);
        return ::rocket::request::Outcome::Error(($status, $expr));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_code_overrides_defaults() {
        let err = Error::new("nope", "nope").with_code("UNAUTHORIZED", 401);
        assert_eq!(err.error_code(), "UNAUTHORIZED");
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_new_defaults_to_bad_request() {
        let err = Error::new("user facing", "log detail");
        assert_eq!(err.status(), 400);
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert_eq!(err.message(), "user facing");
    }

    #[test]
    fn test_infrastructure_conversions_are_5xx() {
        let err = Error::from(diesel::result::Error::NotFound);
        assert_eq!(err.status(), 500);
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_option_map_res() {
        let some: Option<u8> = Some(1);
        assert_eq!(some.map_res("missing").unwrap(), 1);
        let none: Option<u8> = None;
        assert!(none.map_res("missing").is_err());
    }
}
