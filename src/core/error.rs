use super::engine::EvalError;
use super::period::ChainError;
use super::schema::SchemaError;
use super::store::StoreError;

/// Any failure of the domain layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn chain_error(&self) -> Option<&ChainError> {
        match self {
            Error::Chain(e) | Error::Store(StoreError::Chain(e)) => Some(e),
            _ => None,
        }
    }

    /// Broken regime definitions and engine faults. Fail fast, never retry.
    pub fn is_defect(&self) -> bool {
        match self {
            Error::Schema(_) => true,
            Error::Eval(e) => e.is_defect(),
            _ => matches!(self.chain_error(), Some(ChainError::Eval(e)) if e.is_defect()),
        }
    }

    /// A concurrent writer held the chain.
    pub fn is_retryable(&self) -> bool {
        self.chain_error().is_some_and(ChainError::is_retryable)
    }
}
