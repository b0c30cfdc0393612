//! Tandem error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The specified resource is not known to the system.
    #[error("the specified resource is not found")]
    ResourceNotFound,
    /// The addressed queue has not been declared on the bus.
    #[error("the queue '{0}' is not declared on the bus")]
    UnknownQueue(String),
    /// The ID allocator could not produce an unused ID.
    #[error("could not allocate an unused ID after {0} attempts")]
    IdExhausted(usize),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}
