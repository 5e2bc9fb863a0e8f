#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("missing_model")]
    MissingModel,
    #[error("malformed_tool_arguments: {0}")]
    MalformedToolArguments(String),
}
