//! Login service: binds a user to the caller's own channel.
//!
//! Identity is taken on trust; the demo server has no user store.

use super::{get_i64_param, get_str_param, require_str_param};
use cmms_core::CallContext;
use serde_json::{json, Value};

/// Role assigned when the caller does not name one.
const DEFAULT_ROLE: &str = "Worker";

pub fn login(ctx: &CallContext, params: &Value) -> cmms_core::Result<Value> {
    let username = require_str_param(params, "username", "Username")?;
    let role = get_str_param(params, "role", "Role").unwrap_or(DEFAULT_ROLE);
    let user_id = get_i64_param(params, "user_id", "UserID")
        .unwrap_or_else(|| ctx.connection.get() as i64);

    let session = ctx.channels.login(ctx.connection, user_id, username, role)?;
    Ok(serde_json::to_value(session)?)
}

pub fn logout(ctx: &CallContext, _params: &Value) -> cmms_core::Result<Value> {
    Ok(json!(ctx.channels.logout(ctx.connection)))
}

pub fn whoami(ctx: &CallContext, _params: &Value) -> cmms_core::Result<Value> {
    Ok(serde_json::to_value(&ctx.session)?)
}
