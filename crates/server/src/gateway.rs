// SPDX-License-Identifier: PolyForm-Shield-1.0

use anyhow::Result;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::warn;

use counter::{pricing, CountError, CounterRouter};
use extract::ExtractError;
use protocol::{
    AddModelRequest, AddModelResponse, ErrorBody, ModelKind, ModelList, PricingInfo,
    TokenCountRequest, TokenCountResponse,
};
use registry::{RegistryError, RegistryService, MIN_NAME_LEN};

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headroom on top of the upload limit for multipart framing and the text
/// fields, so oversized files reach the extractor and get a proper 413.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: RegistryService,
    pub counter: CounterRouter,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Count(#[from] CountError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Registry(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            ApiError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Count(CountError::UnsupportedModel(_)) => StatusCode::BAD_REQUEST,
            ApiError::Count(CountError::MissingCredential { .. }) => StatusCode::UNAUTHORIZED,
            ApiError::Count(CountError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Extract(ExtractError::UnsupportedType { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Extract(ExtractError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Extract(ExtractError::Malformed { .. }) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unprocessable(_) => "validation_error",
            ApiError::Registry(RegistryError::InvalidName { .. }) => "invalid_model_name",
            ApiError::Registry(_) => "registry_error",
            ApiError::Count(CountError::UnsupportedModel(_)) => "unsupported_model",
            ApiError::Count(CountError::MissingCredential { .. }) => "api_key_missing",
            ApiError::Count(CountError::Backend(_)) => "counting_failed",
            ApiError::Extract(ExtractError::UnsupportedType { .. }) => "unsupported_file_type",
            ApiError::Extract(ExtractError::TooLarge { .. }) => "file_too_large",
            ApiError::Extract(ExtractError::Malformed { .. }) => "unreadable_file",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Unprocessable(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
            error_code: Some(self.code().to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn router(state: GatewayState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/models", get(handle_list_models).post(handle_add_model))
        .route("/api/pricing/{*model}", get(handle_pricing))
        .route("/api/count-tokens", post(handle_count_tokens))
        .route(
            "/api/count-tokens/file",
            post(handle_count_tokens_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: GatewayState) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: API_VERSION,
    })
}

pub async fn handle_list_models(State(state): State<GatewayState>) -> Result<Json<ModelList>, ApiError> {
    Ok(Json(state.registry.list_models().await?))
}

pub async fn handle_add_model(
    State(state): State<GatewayState>,
    payload: Result<Json<AddModelRequest>, JsonRejection>,
) -> Result<Json<AddModelResponse>, ApiError> {
    let Json(req) = payload?;
    let outcome = state.registry.add_model(&req.name, req.category).await?;
    Ok(Json(AddModelResponse {
        models: outcome.models,
        was_new: outcome.is_new,
    }))
}

pub async fn handle_pricing(Path(model): Path<String>) -> Json<PricingInfo> {
    Json(pricing::pricing_info(&model))
}

pub async fn handle_count_tokens(
    State(state): State<GatewayState>,
    payload: Result<Json<TokenCountRequest>, JsonRejection>,
) -> Result<Json<TokenCountResponse>, ApiError> {
    let Json(req) = payload?;
    if req.text.is_empty() {
        return Err(ApiError::Unprocessable("text must not be empty".into()));
    }
    validate_model_field(&req.model)?;
    count_and_record(&state, &req.model, &req.text, req.model_type).await
}

pub async fn handle_count_tokens_file(
    State(state): State<GatewayState>,
    mut multipart: Multipart,
) -> Result<Json<TokenCountResponse>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut model: Option<String> = None;
    let mut model_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                file = Some((filename, bytes.to_vec()));
            }
            "model" => model = Some(field.text().await?),
            "model_type" => model_type = Some(field.text().await?),
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::Unprocessable("missing form field `file`".into()))?;
    let model = model.ok_or_else(|| ApiError::Unprocessable("missing form field `model`".into()))?;
    let model_type =
        model_type.ok_or_else(|| ApiError::Unprocessable("missing form field `model_type`".into()))?;

    validate_model_field(&model)?;
    let kind: ModelKind = model_type
        .parse()
        .map_err(|e: protocol::UnknownModelKind| ApiError::BadRequest(e.to_string()))?;

    let max = state.max_upload_bytes;
    let text = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &filename, max))
        .await
        .map_err(|e| ApiError::Count(CountError::Backend(e.into())))??;

    count_and_record(&state, &model, &text, kind).await
}

fn validate_model_field(model: &str) -> Result<(), ApiError> {
    if model.chars().count() < MIN_NAME_LEN {
        return Err(ApiError::Unprocessable(format!(
            "model must be at least {MIN_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Count, then record the model in the registry. A registry failure after a
/// successful count fails the request.
async fn count_and_record(
    state: &GatewayState,
    model: &str,
    text: &str,
    kind: ModelKind,
) -> Result<Json<TokenCountResponse>, ApiError> {
    let response = state.counter.count(model, text, kind).await?;
    state.registry.add_model(&response.model, kind.category()).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use protocol::Category;
    use tower::ServiceExt;

    use counter::TokenCounter;

    struct Fixed(usize);

    #[async_trait]
    impl TokenCounter for Fixed {
        async fn count(&self, _model: &str, _text: &str) -> Result<usize, CountError> {
            Ok(self.0)
        }
    }

    fn state_in(dir: &std::path::Path) -> GatewayState {
        let path = dir.join("models.json");
        std::fs::write(&path, r#"{"official": [], "custom": []}"#).unwrap();
        GatewayState {
            registry: RegistryService::open(&path).unwrap(),
            counter: CounterRouter::from_parts(
                Some(Arc::new(Fixed(10))),
                None,
                Arc::new(Fixed(4)),
                Arc::new(Fixed(7)),
            ),
            max_upload_bytes: 1024,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_body(boundary: &str, parts: &[(&str, Option<&str>, &str)]) -> String {
        let mut body = String::new();
        for (name, filename, value) in parts {
            body.push_str(&format!("--{boundary}\r\n"));
            match filename {
                Some(f) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        body
    }

    fn multipart_request(body: String) -> Request<Body> {
        Request::post("/api/count-tokens/file")
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let Json(health) = handle_health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, API_VERSION);
    }

    #[tokio::test]
    async fn add_model_returns_list_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let req = AddModelRequest {
            name: "GPT-4o".into(),
            category: Category::Official,
        };

        let Json(first) = handle_add_model(State(state.clone()), Ok(Json(req.clone())))
            .await
            .unwrap();
        assert!(first.was_new);
        assert_eq!(first.models.official, vec!["gpt-4o"]);

        let Json(second) = handle_add_model(State(state.clone()), Ok(Json(req)))
            .await
            .unwrap();
        assert!(!second.was_new);
        assert_eq!(second.models.version, 2);

        let Json(list) = handle_list_models(State(state)).await.unwrap();
        assert_eq!(list.official, vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn invalid_model_name_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let req = AddModelRequest {
            name: " ".into(),
            category: Category::Custom,
        };

        let response = handle_add_model(State(state), Ok(Json(req)))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "invalid_model_name");
    }

    #[tokio::test]
    async fn count_tokens_records_model_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let Json(resp) = handle_count_tokens(
            State(state.clone()),
            Ok(Json(TokenCountRequest {
                text: "hello".into(),
                model: "Claude-3-7-Sonnet".into(),
                model_type: ModelKind::Commercial,
            })),
        )
        .await
        .unwrap();
        assert_eq!(resp.token_count, 10);
        assert_eq!(resp.context_window, Some(200_000));

        handle_count_tokens(
            State(state.clone()),
            Ok(Json(TokenCountRequest {
                text: "hello".into(),
                model: "Qwen/Qwen3-8B".into(),
                model_type: ModelKind::HuggingFace,
            })),
        )
        .await
        .unwrap();

        let list = state.registry.list_models().await.unwrap();
        assert_eq!(list.official, vec!["claude-3-7-sonnet"]);
        assert_eq!(list.custom, vec!["qwen/qwen3-8b"]);
    }

    #[tokio::test]
    async fn count_errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let count = |model: &str, text: &str| {
            handle_count_tokens(
                State(state.clone()),
                Ok(Json(TokenCountRequest {
                    text: text.into(),
                    model: model.into(),
                    model_type: ModelKind::Commercial,
                })),
            )
        };

        let missing_key = count("gemini-2.0-flash", "hi").await.unwrap_err();
        assert_eq!(missing_key.into_response().status(), StatusCode::UNAUTHORIZED);

        let unsupported = count("mistral-large", "hi").await.unwrap_err();
        assert_eq!(unsupported.into_response().status(), StatusCode::BAD_REQUEST);

        let empty = count("gpt-4o", "").await.unwrap_err();
        assert_eq!(empty.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);

        // nothing was recorded for failed counts
        assert_eq!(state.registry.version(), 0);
    }

    #[tokio::test]
    async fn pricing_route_accepts_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state_in(dir.path()));

        let response = app
            .clone()
            .oneshot(Request::get("/api/pricing/GPT-4o-mini").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["input_price"], 0.15);
        assert_eq!(body["context_window_formatted"], "128K");

        let response = app
            .oneshot(Request::get("/api/pricing/qwen/qwen3-8b").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["model"], "qwen/qwen3-8b");
        assert!(body["input_price"].is_null());
    }

    #[tokio::test]
    async fn file_upload_counts_extracted_text() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let app = router(state.clone());

        let body = multipart_body(
            "XBOUNDARY",
            &[
                ("file", Some("notes.md"), "# hello"),
                ("model", None, "gpt-4o"),
                ("model_type", None, "commercial"),
            ],
        );
        let response = app.oneshot(multipart_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token_count"], 4);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(state.registry.official_models().await.unwrap(), vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn file_upload_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state_in(dir.path()));

        let unsupported = multipart_body(
            "XBOUNDARY",
            &[
                ("file", Some("deck.pptx"), "data"),
                ("model", None, "gpt-4o"),
                ("model_type", None, "commercial"),
            ],
        );
        let response = app.clone().oneshot(multipart_request(unsupported)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let big = "a".repeat(2048);
        let too_large = multipart_body(
            "XBOUNDARY",
            &[
                ("file", Some("big.txt"), &big),
                ("model", None, "gpt-4o"),
                ("model_type", None, "commercial"),
            ],
        );
        let response = app.clone().oneshot(multipart_request(too_large)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "file_too_large");

        let bad_kind = multipart_body(
            "XBOUNDARY",
            &[
                ("file", Some("a.txt"), "hello"),
                ("model", None, "gpt-4o"),
                ("model_type", None, "closed"),
            ],
        );
        let response = app.oneshot(multipart_request(bad_kind)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
