mod log;
mod oauth_client;
mod oauth_grant;
mod oauth_token;
mod qr_login;
mod user;
mod verification;

pub use self::log::{AdminLog, UserLog};
pub use self::oauth_client::{NewOauthClient, OauthClient, OauthClientId};
pub use self::oauth_grant::OauthGrant;
pub use self::oauth_token::{AccessToken, AuthorizationCode, RefreshToken};
pub use self::qr_login::{QrLoginStatus, QrLoginToken};
pub use self::user::{NewUser, User, UserId, UserRole};
pub use self::verification::{CodeIntent, OneShotToken, VerificationCode};
