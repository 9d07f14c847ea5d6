//! Utility service handlers.

use cmms_core::{CallContext, TransportError};
use serde_json::{json, Value};

pub fn ping(_ctx: &CallContext, _params: &Value) -> cmms_core::Result<Value> {
    Ok(json!("pong"))
}

pub fn echo(_ctx: &CallContext, params: &Value) -> cmms_core::Result<Value> {
    Ok(params.clone())
}

/// List every live session. Admin only.
pub fn sessions(ctx: &CallContext, _params: &Value) -> cmms_core::Result<Value> {
    if !ctx.session.is_admin() {
        return Err(TransportError::call("Permission denied: admin role required"));
    }
    Ok(serde_json::to_value(ctx.channels.sessions())?)
}
