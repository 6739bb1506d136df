use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Grammar, bracket or conflicting-value errors while parsing request
    /// arguments. Maps to 400.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Type coercion or operator check failed against a declared parameter.
    /// Maps to 400.
    #[error("validation failed: {0}")]
    Validate(String),

    /// Parameter declarations from two modules cannot be merged. Fatal at
    /// startup.
    #[error("parameter configuration error: {0}")]
    Config(String),
}
