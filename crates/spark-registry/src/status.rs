//! 结果分类：把错误映射到一个很小的封闭状态码集合，供日志、指标与追踪打标签。
//!
//! 状态码的完整分类体系由外部协作者定义；这里只约定 [`Classify`] 接口与一个覆盖本 crate
//! 错误类型的默认实现。

use std::{error::Error, fmt};

use crate::error::{BackendError, RegistryError};

/// 封闭的结果状态码集合，`Ok` 为唯一的成功值。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    Unavailable,
    Internal,
    Unknown,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        self == StatusCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::NotFound => "not_found",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
            StatusCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `classify(error) -> StatusCode` 协作接口。
///
/// - **契约 (What)**：实现必须是纯函数且线程安全；无法识别的错误返回 [`StatusCode::Unknown`]。
pub trait Classify: Send + Sync + 'static {
    fn classify(&self, error: &(dyn Error + 'static)) -> StatusCode;

    /// 对一次调用结果打标签：没有错误即 [`StatusCode::Ok`]。
    fn outcome(&self, error: Option<&(dyn Error + 'static)>) -> StatusCode {
        error.map_or(StatusCode::Ok, |err| self.classify(err))
    }
}

/// 识别 [`RegistryError`] 与 [`BackendError`] 的默认分类器。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    fn backend(error: &BackendError) -> StatusCode {
        match error {
            BackendError::Unavailable { .. } => StatusCode::Unavailable,
            BackendError::LeaseNotFound { .. } => StatusCode::NotFound,
            BackendError::Timeout { .. } => StatusCode::DeadlineExceeded,
        }
    }
}

impl Classify for DefaultClassifier {
    fn classify(&self, error: &(dyn Error + 'static)) -> StatusCode {
        if let Some(err) = error.downcast_ref::<BackendError>() {
            return Self::backend(err);
        }
        match error.downcast_ref::<RegistryError>() {
            Some(RegistryError::Backend { source, .. }) => Self::backend(source),
            Some(
                RegistryError::Configuration { .. }
                | RegistryError::InvalidTarget { .. }
                | RegistryError::Config(_),
            ) => StatusCode::InvalidArgument,
            Some(RegistryError::Encode(_) | RegistryError::Logging(_)) => StatusCode::Internal,
            None => StatusCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backend_failures_are_classified() {
        let classifier = DefaultClassifier;
        let timeout = BackendError::Timeout {
            op: "keep_alive",
            after: Duration::from_secs(1),
        };
        assert_eq!(classifier.classify(&timeout), StatusCode::DeadlineExceeded);

        let wrapped = RegistryError::backend("watch", BackendError::unavailable("down"));
        assert_eq!(classifier.classify(&wrapped), StatusCode::Unavailable);
    }

    #[test]
    fn outcome_labels_success_and_configuration() {
        let classifier = DefaultClassifier;
        assert!(classifier.outcome(None).is_success());

        let bad = RegistryError::Configuration { field: "address" };
        assert_eq!(classifier.outcome(Some(&bad as &(dyn Error + 'static))), StatusCode::InvalidArgument);
    }

    #[test]
    fn foreign_errors_are_unknown() {
        let io = std::io::Error::other("boom");
        assert_eq!(DefaultClassifier.classify(&io), StatusCode::Unknown);
    }
}
