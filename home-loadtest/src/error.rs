/// Problems found while loading run options, reported before any VU starts.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("invalid duration '{0}', expected e.g. '500ms', '10s', '1m30s' or '1h'")]
    InvalidDuration(String),

    #[error("invalid threshold '{expression}' on metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("unknown metric '{0}' in thresholds")]
    UnknownMetric(String),

    #[error("aggregation '{aggregation}' is not supported by metric '{metric}'")]
    UnsupportedAggregation { metric: String, aggregation: String },

    #[error("invalid header '{0}', expected 'Name: value'")]
    InvalidHeader(String),

    #[error("at least one stage is required")]
    NoStages,

    #[error("failed to read options file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse options: {0}")]
    Json(#[from] serde_json::Error),
}
