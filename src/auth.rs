//! Cookie authentication for the user-facing routes.
//!
//! Users log in with the identity provider, which sets a private cookie
//! holding the user ID. This module reads that cookie and rejects requests
//! without a valid one.

use axum::{
    Json,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::{
    PrivateCookieJar,
    cookie::{Cookie, SameSite},
};
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::UserID;

/// The name of the cookie holding the logged in user's ID.
pub const COOKIE_USER_ID: &str = "user_id";
/// The default duration for which auth cookies are valid.
pub const DEFAULT_COOKIE_DURATION: Duration = Duration::hours(1);

/// Add an auth cookie to the cookie jar, indicating that a user is logged in
/// and authenticated.
///
/// Returns the cookie jar with the cookie added.
pub fn set_auth_cookie(jar: PrivateCookieJar, user_id: UserID) -> PrivateCookieJar {
    jar.add(
        Cookie::build((COOKIE_USER_ID, user_id.as_i64().to_string()))
            .expires(OffsetDateTime::now_utc() + DEFAULT_COOKIE_DURATION)
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(true),
    )
}

pub(crate) fn get_user_id_from_auth_cookie(jar: &PrivateCookieJar) -> Option<UserID> {
    let cookie = jar.get(COOKIE_USER_ID)?;

    cookie.value().parse().ok().map(UserID::new)
}

/// Middleware function that checks for a valid authorization cookie.
/// The user ID is placed into request and then the request executed normally
/// if the cookie is valid, otherwise a 401 response is returned.
///
/// **Note**: Route handlers can use the function argument
/// `Extension(user_id): Extension<UserID>` to receive the user ID.
///
/// **Note**: The app state must contain an `axum_extra::extract::cookie::Key`
/// for decrypting and verifying the cookie contents.
pub async fn auth_guard(jar: PrivateCookieJar, mut request: Request, next: Next) -> Response {
    let Some(user_id) = get_user_id_from_auth_cookie(&jar) else {
        tracing::debug!("Rejecting {} without a valid auth cookie", request.uri());

        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "You need to log in to access this resource." })),
        )
            .into_response();
    };

    request.extensions_mut().insert(user_id);

    next.run(request).await
}
