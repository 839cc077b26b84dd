use thiserror::Error;

/// Classification of a failed probe or reload, as reported in a `ProbeResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeErrorKind {
    TargetParse,
    Resolution,
    TransportConstruction,
    RequestExecution,
    Validation,
    ConfigReload,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::TargetParse => "target_parse",
            ProbeErrorKind::Resolution => "resolution",
            ProbeErrorKind::TransportConstruction => "transport_construction",
            ProbeErrorKind::RequestExecution => "request_execution",
            ProbeErrorKind::Validation => "validation",
            ProbeErrorKind::ConfigReload => "config_reload",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not parse target URL {target:?}: {source}")]
    TargetParse {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("error resolving {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("error building HTTP transport: {0}")]
    TransportConstruction(String),

    #[error("HTTP request failed: {0}")]
    RequestExecution(String),

    #[error("{0}")]
    Validation(String),

    #[error("error reloading config: {0}")]
    ConfigReload(String),
}

impl ProbeError {
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::TargetParse { .. } => ProbeErrorKind::TargetParse,
            ProbeError::Resolution { .. } => ProbeErrorKind::Resolution,
            ProbeError::TransportConstruction(_) => ProbeErrorKind::TransportConstruction,
            ProbeError::RequestExecution(_) => ProbeErrorKind::RequestExecution,
            ProbeError::Validation(_) => ProbeErrorKind::Validation,
            ProbeError::ConfigReload(_) => ProbeErrorKind::ConfigReload,
        }
    }

    pub(crate) fn resolution(host: &str, reason: impl Into<String>) -> Self {
        ProbeError::Resolution {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    /// Wraps a transport level error, keeping its whole source chain in the message.
    pub(crate) fn request(err: &(dyn std::error::Error + 'static)) -> Self {
        ProbeError::RequestExecution(crate::http_probe::report(err))
    }
}
