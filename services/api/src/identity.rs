//! Resolves the current user from the WebSocket upgrade request.
//!
//! Authentication happens upstream; the gateway forwards the signed-in user
//! as `x-user-id` / `x-user-name` headers. A request without a user id is an
//! anonymous caller.

use axum::http::HeaderMap;
use interview_core::session_config::Identity;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let id = header_value(headers, USER_ID_HEADER)?;
    let name = header_value(headers, USER_NAME_HEADER).unwrap_or_default();
    Some(Identity { name, id })
}
