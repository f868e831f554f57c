use super::AppState;
use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use restic_core::constants::server::BEARER_PREFIX;
use subtle::ConstantTimeEq;
use tracing::warn;

/// 校验 `Authorization: Bearer <token>`，未配置共享密钥时直接放行
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.api_token.as_deref() {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX));

        if !token_matches(expected, provided) {
            warn!(path = %request.uri().path(), "拒绝未授权的请求");
            return Err(ApiError::Unauthorized);
        }
    }

    Ok(next.run(request).await)
}

/// 常数时间比较，耗时不随匹配的前缀长度变化
fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    provided.is_some_and(|token| expected.as_bytes().ct_eq(token.as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("s3cret", Some("s3cret")));
        assert!(!token_matches("s3cret", Some("s3cre")));
        assert!(!token_matches("s3cret", Some("s3cret!")));
        assert!(!token_matches("s3cret", Some("")));
        assert!(!token_matches("s3cret", None));
    }
}
