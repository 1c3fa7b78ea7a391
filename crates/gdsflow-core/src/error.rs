use thiserror::Error;

/// Fatal errors: a malformed graph or campaign stops the run before it
/// starts, a scheduler fault aborts it mid-flight. Per-action tool failures
/// are *not* errors — they are recorded as `Outcome::Failure` on the action
/// and propagated as cancellation to its dependents.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("dependency cycle detected involving action '{0}'")]
    CycleDetected(String),

    #[error("edge references unknown action '{0}'")]
    UnknownAction(String),

    #[error("duplicate action id '{0}'")]
    DuplicateAction(String),

    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("tool '{tool}' not found: {hint}")]
    ToolNotFound { tool: String, hint: String },

    #[error("scheduler fault: {0}")]
    SchedulerFault(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
