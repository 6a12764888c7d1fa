use axum::http::StatusCode;
use axum::response::IntoResponse;
use gateway_http_errors::ApiError;
use uuid::Uuid;

#[test]
fn not_implemented_variant_maps_to_501() {
    let err = ApiError::NotImplemented {
        request_id: Some(Uuid::new_v4().to_string()),
        message: "forwarding to the upstream provider is not wired yet".into(),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "NotImplementedError"
    );
}

#[test]
fn not_found_variant_maps_to_404() {
    let err = ApiError::NotFound { request_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "NotFoundError");
}

#[test]
fn service_unavailable_variant_maps_to_503() {
    let err = ApiError::ServiceUnavailable {
        request_id: None,
        message: "analyzer unreachable after retries".into(),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "ServiceUnavailableError"
    );
}

#[test]
fn internal_variant_maps_to_500() {
    let err = ApiError::Internal {
        request_id: Some(Uuid::new_v4().to_string()),
        message: "unexpected panic recovered".into(),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "InternalServerError"
    );
}
