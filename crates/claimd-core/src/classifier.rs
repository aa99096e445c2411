//! Failure classification.
//!
//! Maps raw failure signals (HTTP status, error text, page content) onto a
//! closed set of [`ErrorCategory`] values. Classification is a pure lookup
//! over an ordered rule table: the first rule that matches wins, so the
//! table order *is* the precedence order.
//!
//! ```text
//! permanent > rate_limit > proxy_issue > captcha_failed > config_error
//!           > faucet_down > transient > unknown
//! ```
//!
//! Anti-bot and maintenance pages deliberately land in `rate_limit` rather
//! than `permanent`: they clear up on their own and must never disable a job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::job::TaskResult;

/// Closed set of failure categories, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permanent,
    RateLimit,
    ProxyIssue,
    CaptchaFailed,
    ConfigError,
    FaucetDown,
    Transient,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Permanent,
        ErrorCategory::RateLimit,
        ErrorCategory::ProxyIssue,
        ErrorCategory::CaptchaFailed,
        ErrorCategory::ConfigError,
        ErrorCategory::FaucetDown,
        ErrorCategory::Transient,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ProxyIssue => "proxy_issue",
            ErrorCategory::CaptchaFailed => "captcha_failed",
            ErrorCategory::ConfigError => "config_error",
            ErrorCategory::FaucetDown => "faucet_down",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Only `permanent` ends a job's lifecycle.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    /// Whether the failure says something about the egress path rather than
    /// the account or the target. Drives proxy health on release.
    pub fn implicates_proxy(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ProxyIssue
                | ErrorCategory::RateLimit
                | ErrorCategory::Transient
                | ErrorCategory::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "permanent" => Ok(ErrorCategory::Permanent),
            "rate_limit" => Ok(ErrorCategory::RateLimit),
            "proxy_issue" => Ok(ErrorCategory::ProxyIssue),
            "captcha_failed" => Ok(ErrorCategory::CaptchaFailed),
            "config_error" => Ok(ErrorCategory::ConfigError),
            "faucet_down" => Ok(ErrorCategory::FaucetDown),
            "transient" => Ok(ErrorCategory::Transient),
            "unknown" => Ok(ErrorCategory::Unknown),
            _ => Err(format!("Unknown error category: {}", s)),
        }
    }
}

/// Raw failure evidence handed to [`classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSignal {
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub page_content: Option<String>,
}

impl FailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_page_content(mut self, content: impl Into<String>) -> Self {
        self.page_content = Some(content.into());
        self
    }

    /// Build a signal from an error raised by task logic.
    pub fn from_error(error: &AppError) -> Self {
        let mut signal = Self::new().with_message(error.to_string());
        if let Some(code) = error.status_code() {
            signal = signal.with_status(code);
        }
        if error.is_transient() {
            // Normalise so the transient rule matches regardless of wording.
            let msg = format!("network timeout: {error}");
            signal.message = Some(msg);
        }
        signal
    }

    /// Build a signal from a failed task result.
    pub fn from_result(result: &TaskResult) -> Self {
        Self {
            status_code: result.status_code,
            message: Some(result.status.clone()),
            page_content: result.page_content.clone(),
        }
    }

    /// Lowercased haystack over message and page content.
    fn haystack(&self) -> String {
        let mut text = String::new();
        if let Some(msg) = &self.message {
            text.push_str(&msg.to_lowercase());
        }
        if let Some(page) = &self.page_content {
            text.push('\n');
            text.push_str(&page.to_lowercase());
        }
        text
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub status_codes: &'static [u16],
    pub patterns: &'static [&'static str],
}

impl ClassificationRule {
    fn matches(&self, status: Option<u16>, haystack: &str) -> bool {
        if let Some(code) = status
            && self.status_codes.contains(&code)
        {
            return true;
        }
        self.patterns.iter().any(|p| haystack.contains(p))
    }
}

/// Ordered rule table. Earlier rows take precedence.
pub const RULES: &[ClassificationRule] = &[
    ClassificationRule {
        category: ErrorCategory::Permanent,
        status_codes: &[],
        patterns: &[
            "banned",
            "suspended",
            "invalid credentials",
            "authentication failed",
            "account disabled",
            "account locked",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::RateLimit,
        status_codes: &[429],
        patterns: &[
            "cloudflare",
            "security check",
            "ddos protection",
            "maintenance",
            "blocked",
            "challenge",
            "just a moment",
            "too many requests",
            "rate limit",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::ProxyIssue,
        status_codes: &[],
        patterns: &[
            "proxy detected",
            "vpn detected",
            "unusual activity from your ip",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::CaptchaFailed,
        status_codes: &[],
        patterns: &[
            "captcha failed",
            "captcha timeout",
            "captcha solve failed",
            "failed to solve captcha",
            "captcha not solved",
            "solver timeout",
            "invalid captcha",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::ConfigError,
        status_codes: &[],
        patterns: &[
            "unsupported captcha type",
            "unknown captcha type",
            "captcha type",
            "no captcha provider",
            "solver api key",
            "invalid api key",
            "missing api key",
            "configuration error",
            "misconfigured",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::FaucetDown,
        status_codes: &[500, 503],
        patterns: &[
            "service unavailable",
            "internal server error",
            "site is down",
            "temporarily unavailable",
            "faucet is empty",
            "out of funds",
        ],
    },
    ClassificationRule {
        category: ErrorCategory::Transient,
        status_codes: &[],
        patterns: &[
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "connection closed",
            "connection aborted",
            "broken pipe",
            "network error",
            "dns error",
        ],
    },
];

/// Classify a failure signal. Pure and idempotent.
pub fn classify(signal: &FailureSignal) -> ErrorCategory {
    let haystack = signal.haystack();
    RULES
        .iter()
        .find(|rule| rule.matches(signal.status_code, &haystack))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Category for a finished task: `None` on success, the task's explicit
/// category when it set one, otherwise whatever the rule table says.
pub fn classify_result(result: &TaskResult) -> Option<ErrorCategory> {
    if result.success {
        return None;
    }
    Some(
        result
            .error_category
            .unwrap_or_else(|| classify(&FailureSignal::from_result(result))),
    )
}
