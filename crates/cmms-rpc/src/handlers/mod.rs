//! Call handlers for the demo server, split by service.

mod login;
mod util;

use cmms_core::{CallContext, RpcDispatch, TransportError};
use serde_json::Value;

/// Routes `Service.Method` names to their handlers.
pub struct DemoDispatch;

#[async_trait::async_trait]
impl RpcDispatch for DemoDispatch {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Value,
    ) -> cmms_core::Result<Value> {
        match method {
            "Util.Ping" => util::ping(ctx, &params),
            "Util.Echo" => util::echo(ctx, &params),
            "Util.Sessions" => util::sessions(ctx, &params),
            "Login.Login" => login::login(ctx, &params),
            "Login.Logout" => login::logout(ctx, &params),
            "Login.Whoami" => login::whoami(ctx, &params),
            _ => Err(TransportError::call(format!("Unknown method: {}", method))),
        }
    }
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and PascalCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, pascal: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(pascal))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(
    params: &Value,
    snake: &str,
    pascal: &str,
) -> cmms_core::Result<String> {
    get_str_param(params, snake, pascal)
        .map(String::from)
        .ok_or_else(|| TransportError::call(format!("Missing required parameter: {}", snake)))
}

/// Extract an optional i64 parameter, supporting both snake_case and PascalCase.
pub(crate) fn get_i64_param(params: &Value, snake: &str, pascal: &str) -> Option<i64> {
    params
        .get(snake)
        .or_else(|| params.get(pascal))
        .and_then(|v| v.as_i64())
}
