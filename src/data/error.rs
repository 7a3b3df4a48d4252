use thiserror::Error;

use crate::database::engine::EngineError;

/// Errors surfaced by the data-access layer. Storage errors pass through
/// untouched; the only error this layer adds is the not-found class
/// raised by or-throw unique lookups.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("{entity} not found{}", soft_suffix(.soft_deleted))]
    NotFound { entity: String, soft_deleted: bool },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn soft_suffix(soft_deleted: &bool) -> &'static str {
    if *soft_deleted {
        " (soft-deleted)"
    } else {
        ""
    }
}

impl DataError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DataError::NotFound { .. } | DataError::Engine(EngineError::TargetNotFound { .. })
        )
    }
}
