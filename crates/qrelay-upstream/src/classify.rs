// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Substring classification of upstream error bodies.
//!
//! The table is ordered and the first match wins — several upstream bodies
//! contain multiple markers (a `ValidationException` wrapping an
//! `Improperly formed request`, for instance), and the more specific marker
//! must take precedence.  Each verdict separates the two fates a failure
//! can have: `Request` errors are terminal for the client call, `Account`
//! errors rotate the pipeline onto the next credential.

/// What the failure means for the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is bad: fail the client with 400, touch nothing.
    Request,
    /// The account is at fault: mark it and pick another one.
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Client-facing friendly message.
    pub message: &'static str,
    /// Actionable hint for the caller.
    pub hint: &'static str,
    pub kind: ErrorKind,
}

impl Classified {
    pub fn is_request_error(&self) -> bool {
        self.kind == ErrorKind::Request
    }
}

/// `(pattern, code, message, hint, kind)` — order matters, first match wins.
#[rustfmt::skip]
const TABLE: &[(&str, &str, &str, &str, ErrorKind)] = &[
    ("CONTENT_LENGTH_EXCEEDS_THRESHOLD", "CONTENT_LENGTH_EXCEEDS_THRESHOLD",
     "请求内容超过上游长度限制", "请缩短对话历史或开启上下文压缩后重试", ErrorKind::Request),
    ("Input is too long", "INPUT_TOO_LONG",
     "输入内容过长", "请减少输入内容或开启上下文压缩后重试", ErrorKind::Request),
    ("Improperly formed request", "INVALID_REQUEST",
     "请求格式不正确", "请检查消息结构与工具定义是否完整", ErrorKind::Request),
    ("ServiceQuotaExceededException", "QUOTA_EXCEEDED",
     "该账号配额已用尽", "网关将自动切换账号，无需操作", ErrorKind::Account),
    ("TEMPORARILY_SUSPENDED", "TEMPORARILY_SUSPENDED",
     "该账号被上游临时停用", "网关将自动切换账号，无需操作", ErrorKind::Account),
    ("temporarily is suspended", "TEMPORARILY_SUSPENDED",
     "该账号被上游临时停用", "网关将自动切换账号，无需操作", ErrorKind::Account),
    ("AccessDeniedException", "ACCESS_DENIED",
     "该账号无访问权限", "网关将自动切换账号，无需操作", ErrorKind::Account),
    ("UnauthorizedException", "UNAUTHORIZED",
     "账号凭证校验失败", "网关将刷新令牌并自动切换账号", ErrorKind::Account),
    ("ExpiredTokenException", "EXPIRED_TOKEN",
     "账号令牌已过期", "网关将刷新令牌并自动切换账号", ErrorKind::Account),
    ("INVALID_TOKEN", "INVALID_TOKEN",
     "账号令牌无效", "网关将刷新令牌并自动切换账号", ErrorKind::Account),
    ("ResourceNotFoundException", "RESOURCE_NOT_FOUND",
     "请求的上游资源不存在", "请确认模型与接口配置是否正确", ErrorKind::Request),
    ("INVALID_MODEL_ID", "INVALID_MODEL",
     "模型名称无效", "请使用网关支持的 Claude 模型名称", ErrorKind::Request),
    ("Invalid model", "INVALID_MODEL",
     "模型名称无效", "请使用网关支持的 Claude 模型名称", ErrorKind::Request),
    ("ValidationException", "VALIDATION_ERROR",
     "请求未通过上游校验", "请检查请求参数后重试", ErrorKind::Request),
    ("ThrottlingException", "THROTTLING",
     "该账号被上游限流", "网关将自动切换账号，稍后自动恢复", ErrorKind::Account),
    ("INSUFFICIENT_MODEL_CAPACITY", "INSUFFICIENT_CAPACITY",
     "上游模型容量不足", "网关将自动切换账号，稍后自动恢复", ErrorKind::Account),
    ("Encountered an unexpected error", "UNEXPECTED_ERROR",
     "上游发生未知错误", "网关将自动切换账号重试", ErrorKind::Account),
];

/// Classify an upstream error body.  `None` when no pattern matches.
pub fn classify(body: &str) -> Option<Classified> {
    for (pattern, code, message, hint, kind) in TABLE {
        if body.contains(pattern) {
            return Some(Classified {
                code,
                message,
                hint,
                kind: *kind,
            });
        }
    }
    None
}

/// Classify, falling back to a generic account-kind verdict so the pipeline
/// always rotates on unrecognized failures rather than failing the client.
pub fn classify_or_unknown(body: &str) -> Classified {
    classify(body).unwrap_or(Classified {
        code: "UNKNOWN_ERROR",
        message: "上游返回了无法识别的错误",
        hint: "网关将自动切换账号重试",
        kind: ErrorKind::Account,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_is_account_error() {
        let c = classify(r#"{"__type":"ServiceQuotaExceededException","message":"..."}"#).unwrap();
        assert_eq!(c.code, "QUOTA_EXCEEDED");
        assert_eq!(c.kind, ErrorKind::Account);
    }

    #[test]
    fn input_too_long_is_request_error() {
        let c = classify("Input is too long for the requested model").unwrap();
        assert_eq!(c.code, "INPUT_TOO_LONG");
        assert!(c.is_request_error());
    }

    #[test]
    fn specific_marker_wins_over_validation_exception() {
        // A ValidationException wrapping the length marker must classify as
        // the length error, not the generic validation one.
        let body = r#"{"__type":"ValidationException","message":"Improperly formed request"}"#;
        assert_eq!(classify(body).unwrap().code, "INVALID_REQUEST");

        let body = r#"{"__type":"ValidationException","message":"Input is too long"}"#;
        assert_eq!(classify(body).unwrap().code, "INPUT_TOO_LONG");
    }

    #[test]
    fn bare_validation_exception_is_request_error() {
        let c = classify(r#"{"__type":"ValidationException"}"#).unwrap();
        assert_eq!(c.code, "VALIDATION_ERROR");
        assert!(c.is_request_error());
    }

    #[test]
    fn suspension_both_spellings() {
        assert_eq!(classify("TEMPORARILY_SUSPENDED").unwrap().code, "TEMPORARILY_SUSPENDED");
        assert_eq!(
            classify("Your account temporarily is suspended").unwrap().code,
            "TEMPORARILY_SUSPENDED"
        );
    }

    #[test]
    fn auth_errors_are_account_kind() {
        for body in ["UnauthorizedException", "ExpiredTokenException", "INVALID_TOKEN"] {
            let c = classify(body).unwrap();
            assert_eq!(c.kind, ErrorKind::Account, "{body} must be account-kind");
        }
    }

    #[test]
    fn invalid_model_both_spellings() {
        assert_eq!(classify("INVALID_MODEL_ID").unwrap().code, "INVALID_MODEL");
        assert_eq!(classify("Invalid model requested").unwrap().code, "INVALID_MODEL");
    }

    #[test]
    fn throttling_and_capacity_are_account_kind() {
        assert_eq!(classify("ThrottlingException").unwrap().code, "THROTTLING");
        let c = classify("INSUFFICIENT_MODEL_CAPACITY").unwrap();
        assert_eq!(c.code, "INSUFFICIENT_CAPACITY");
        assert_eq!(c.kind, ErrorKind::Account);
    }

    #[test]
    fn unmatched_body_returns_none() {
        assert!(classify("weird new failure mode").is_none());
    }

    #[test]
    fn unknown_fallback_is_account_kind() {
        let c = classify_or_unknown("weird new failure mode");
        assert_eq!(c.code, "UNKNOWN_ERROR");
        assert_eq!(c.kind, ErrorKind::Account);
    }

    #[test]
    fn every_message_and_hint_is_non_empty() {
        for (pattern, ..) in TABLE {
            let c = classify(pattern).unwrap();
            assert!(!c.message.is_empty());
            assert!(!c.hint.is_empty());
        }
    }
}
