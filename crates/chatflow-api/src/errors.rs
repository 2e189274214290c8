// EngineError -> HTTP response mapping shared by all route modules

use axum::{http::StatusCode, Json};
use chatflow_contracts::ErrorResponse;
use chatflow_engine::EngineError;
use chatflow_storage::StoreError;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::ExecutionNotFound(_)
        | EngineError::UnknownSender(_)
        | EngineError::UnknownCorrelation(_)
        | EngineError::Store(StoreError::DefinitionNotFound(_))
        | EngineError::Store(StoreError::ExecutionNotFound(_))
        | EngineError::Store(StoreError::StepNotFound(_)) => StatusCode::NOT_FOUND,

        EngineError::SessionBusy(_)
        | EngineError::StaleSignal(_)
        | EngineError::ExecutionNotWaiting(_)
        | EngineError::DefinitionNotActive(_) => StatusCode::CONFLICT,

        EngineError::InvalidTrigger(_) => StatusCode::BAD_REQUEST,

        _ => {
            tracing::error!(error = %e, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse::new(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn signal_conflicts_map_to_409() {
        let id = Uuid::now_v7();
        assert_eq!(engine_error(EngineError::StaleSignal(id)).0, StatusCode::CONFLICT);
        assert_eq!(
            engine_error(EngineError::SessionBusy("u1".to_string())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            engine_error(EngineError::ExecutionNotWaiting(id)).0,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn unknown_routing_maps_to_404() {
        assert_eq!(
            engine_error(EngineError::UnknownSender("u9".to_string())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            engine_error(EngineError::UnknownCorrelation(Uuid::now_v7())).0,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn bad_trigger_maps_to_400() {
        assert_eq!(
            engine_error(EngineError::InvalidTrigger("nope".to_string())).0,
            StatusCode::BAD_REQUEST
        );
    }
}
