/// A noteworthy event from a deploy or undeploy call.
///
/// Everything here is also logged through `tracing`; the copy in the outcome
/// lets the plugin host report it next to the result without installing a
/// subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Informational message (progress, resolved resources).
    Info(String),
    /// The call continued but something differs from what was requested.
    Warning(String),
}

impl Feedback {
    pub fn info(msg: impl Into<String>) -> Self {
        Self::Info(msg.into())
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self::Warning(msg.into())
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Info(msg) | Self::Warning(msg) => msg,
        }
    }
}

impl std::fmt::Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info(msg) => write!(f, "{msg}"),
            Self::Warning(msg) => write!(f, "warning: {msg}"),
        }
    }
}
