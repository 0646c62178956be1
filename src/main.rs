//! Tax Assistant - document intake, refund estimates, CPA chat and form export.

mod assistant;
mod auth;
mod config;
mod error;
mod extractor;
mod fields;
mod forms;
mod ocr;
mod openai;
mod refund;
mod request;
mod schema;
mod session;
mod store;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRef, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{AuthConfig, UserId};
use config::{DocumentProfile, ProfileStore, Settings};
use error::ApiError;
use extractor::Extractor;
use forms::FormKind;
use ocr::mistral::MistralOcrProvider;
use ocr::{OcrProvider, OcrRegistry};
use openai::{ChatBackend, OpenAiClient};
use refund::{RefundBreakdown, StateRateTable};
use request::{optional_json, ApiJson, ApiPath};
use schema::{Dependent, DocumentKind, FilingStatus, TaxDocument, TaxSession};
use session::{Ingested, SessionService};
use store::{MemorySessionStore, MongoSessionStore, SessionStore};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: SessionService,
    extractor: Extractor,
    assistant: Option<Arc<dyn ChatBackend>>,
    profiles: ProfileStore,
    rates: Arc<StateRateTable>,
    auth: AuthConfig,
    templates_dir: Option<PathBuf>,
    max_upload_bytes: usize,
}

impl FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tax_assistant=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    let profiles = match &settings.profiles_dir {
        Some(dir) => ProfileStore::load_with_overrides(dir)?,
        None => ProfileStore::builtin()?,
    };
    info!("Loaded {} document profiles: {:?}", profiles.list().len(), profiles.list());

    let rates = match &settings.state_rates_path {
        Some(path) => StateRateTable::from_path(path)?,
        None => StateRateTable::embedded()?,
    };
    info!("Loaded state rates for {} jurisdictions", rates.len());

    let store: Arc<dyn SessionStore> = match &settings.mongodb_uri {
        Some(uri) => Arc::new(MongoSessionStore::connect(uri, &settings.mongodb_database).await?),
        None => {
            warn!("MONGODB_URI not set; sessions are kept in memory and lost on restart");
            Arc::new(MemorySessionStore::new())
        }
    };

    let http = reqwest::Client::new();

    let remote_ocr = settings.mistral_api_key.as_ref().map(|key| {
        info!("Mistral OCR enabled for scans and images");
        Arc::new(MistralOcrProvider::new(http.clone(), key.clone())) as Arc<dyn OcrProvider>
    });

    let assistant = settings.openai.as_ref().map(|openai| {
        info!("Completion client initialized (model {})", openai.model);
        Arc::new(OpenAiClient::new(http.clone(), openai)) as Arc<dyn ChatBackend>
    });

    let ocr = OcrRegistry::new(remote_ocr);
    if !ocr.has_remote() {
        warn!("MISTRAL_API_KEY not set; only text uploads and text-layer PDFs can be read");
    }

    let mut extractor = Extractor::new(ocr, profiles.clone());
    if let (true, Some(llm)) = (settings.llm_field_fallback, &assistant) {
        info!("LLM field fallback enabled");
        extractor = extractor.with_llm_fallback(llm.clone());
    }

    let auth = AuthConfig::new(settings.jwt_secret.as_deref());
    if !auth.uses_jwt() {
        warn!("JWT_SECRET not set; trusting the X-User-Id header");
    }

    let rates = Arc::new(rates);
    let state = AppState {
        sessions: SessionService::new(store, rates.clone()),
        extractor,
        assistant,
        profiles,
        rates,
        auth,
        templates_dir: settings.templates_dir.clone(),
        max_upload_bytes: settings.max_upload_bytes,
    };

    let app = router(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/profiles", get(list_profiles))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:year", post(open_session).get(get_session))
        .route("/sessions/:year/profile", put(update_profile))
        .route("/sessions/:year/documents", post(upload_document))
        .route("/sessions/:year/documents/manual", post(add_manual_document))
        .route("/sessions/:year/documents/:doc_id", delete(remove_document))
        .route("/sessions/:year/refund", get(get_refund))
        .route("/sessions/:year/chat", post(chat))
        .route("/sessions/:year/forms/1040", get(form_1040))
        .route("/sessions/:year/forms/state/:code", get(form_state))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ProfileUpdate {
    filing_status: Option<FilingStatus>,
    dependents: Option<Vec<Dependent>>,
}

#[derive(Debug, Deserialize)]
struct ManualDocument {
    kind: String,
    #[serde(default)]
    amounts: BTreeMap<String, Decimal>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct DocumentResponse {
    session_id: String,
    tax_year: i32,
    revision: i64,
    duplicate: bool,
    refund_estimate: Decimal,
    document: TaxDocument,
}

impl From<Ingested> for DocumentResponse {
    fn from(ingested: Ingested) -> Self {
        Self {
            session_id: ingested.session.id,
            tax_year: ingested.session.tax_year,
            revision: ingested.session.revision,
            duplicate: ingested.duplicate,
            refund_estimate: ingested.session.refund_estimate,
            document: ingested.document,
        }
    }
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    session_id: String,
    tax_year: i32,
    refund_estimate: Decimal,
    breakdown: RefundBreakdown,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default = "default_true")]
    include_context: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    reply: String,
    model: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// List document profiles.
async fn list_profiles(State(state): State<AppState>) -> Json<Vec<DocumentProfile>> {
    Json(state.profiles.all())
}

async fn list_sessions(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<Vec<TaxSession>>, ApiError> {
    Ok(Json(state.sessions.list(&user).await?))
}

/// Open (find or create) the session for a tax year. The body is an
/// optional profile update.
async fn open_session(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
    body: Bytes,
) -> Result<Json<TaxSession>, ApiError> {
    let year = check_year(year)?;
    let update: Option<ProfileUpdate> = optional_json(&body)?;
    let session = state.sessions.open(&user, year).await?;

    match update {
        Some(update) if update.filing_status.is_some() || update.dependents.is_some() => {
            let session = state
                .sessions
                .update_profile(&user, year, update.filing_status, update.dependents)
                .await?;
            Ok(Json(session))
        }
        _ => Ok(Json(session)),
    }
}

async fn get_session(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
) -> Result<Json<TaxSession>, ApiError> {
    let year = check_year(year)?;
    Ok(Json(state.sessions.get(&user, year).await?))
}

async fn update_profile(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
    ApiJson(update): ApiJson<ProfileUpdate>,
) -> Result<Json<TaxSession>, ApiError> {
    let year = check_year(year)?;
    let session = state
        .sessions
        .update_profile(&user, year, update.filing_status, update.dependents)
        .await?;
    info!("Updated profile for session {}", session.id);
    Ok(Json(session))
}

/// Upload a W-2 or 1099 and add it to the session.
async fn upload_document(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentResponse>), ApiError> {
    let year = check_year(year)?;

    let mut filename = String::new();
    let mut file_data = Vec::new();
    let mut kind_hint = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().unwrap_or("document").to_string();
                file_data = field.bytes().await?.to_vec();
            }
            "kind" => {
                let raw = field.text().await?;
                if !raw.trim().is_empty() {
                    kind_hint = Some(parse_kind(&raw)?);
                }
            }
            _ => {}
        }
    }

    if file_data.is_empty() {
        return Err(ApiError::BadRequest("No file uploaded".to_string()));
    }

    info!(
        "Received file: {} ({} bytes) for {} / {}",
        filename,
        file_data.len(),
        user,
        year
    );

    let document = state
        .extractor
        .extract(&filename, &file_data, kind_hint)
        .await?;
    let ingested = state.sessions.ingest(&user, year, document).await?;

    let status = if ingested.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ingested.into())))
}

async fn add_manual_document(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
    ApiJson(body): ApiJson<ManualDocument>,
) -> Result<(StatusCode, Json<DocumentResponse>), ApiError> {
    let year = check_year(year)?;
    let kind = parse_kind(&body.kind)?;

    let ingested = state
        .sessions
        .add_manual(&user, year, kind, body.amounts, body.attributes)
        .await?;
    Ok((StatusCode::CREATED, Json(ingested.into())))
}

async fn remove_document(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath((year, doc_id)): ApiPath<(i32, String)>,
) -> Result<Json<TaxSession>, ApiError> {
    let year = check_year(year)?;
    Ok(Json(state.sessions.remove_document(&user, year, &doc_id).await?))
}

/// Recompute the refund and return the per-jurisdiction breakdown.
async fn get_refund(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
) -> Result<Json<RefundResponse>, ApiError> {
    let year = check_year(year)?;
    let (session, breakdown) = state.sessions.recalculate(&user, year).await?;

    if !breakdown.unsupported_states.is_empty() {
        warn!(
            "Session {} has documents for unsupported states: {:?}",
            session.id, breakdown.unsupported_states
        );
    }

    Ok(Json(RefundResponse {
        session_id: session.id,
        tax_year: session.tax_year,
        refund_estimate: session.refund_estimate,
        breakdown,
    }))
}

/// Ask the CPA assistant a question about this session.
async fn chat(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
    ApiJson(request): ApiJson<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let year = check_year(year)?;
    let backend = state.assistant.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("The assistant is not configured (OPENAI_API_KEY)".to_string())
    })?;

    let session = state.sessions.open(&user, year).await?;
    let reply = assistant::ask(
        backend.as_ref(),
        &session,
        &request.question,
        request.include_context,
    )
    .await?;

    Ok(Json(ChatResponse {
        reply,
        model: backend.model().to_string(),
    }))
}

async fn form_1040(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath(year): ApiPath<i32>,
) -> Result<Response, ApiError> {
    let year = check_year(year)?;
    render_form(&state, &user, year, FormKind::F1040).await
}

async fn form_state(
    State(state): State<AppState>,
    UserId(user): UserId,
    ApiPath((year, code)): ApiPath<(i32, String)>,
) -> Result<Response, ApiError> {
    let year = check_year(year)?;
    render_form(&state, &user, year, FormKind::state(&code)).await
}

// ============================================================================
// Helper functions
// ============================================================================

fn check_year(year: i32) -> Result<i32, ApiError> {
    if (1990..=2100).contains(&year) {
        Ok(year)
    } else {
        Err(ApiError::BadRequest(format!("Unsupported tax year: {}", year)))
    }
}

fn parse_kind(raw: &str) -> Result<DocumentKind, ApiError> {
    match DocumentKind::parse(raw) {
        Some(DocumentKind::Unknown) | None => Err(ApiError::BadRequest(format!(
            "Unknown document kind {:?}. Expected one of: {}",
            raw,
            DocumentKind::ALL.map(|k| k.as_str()).join(", ")
        ))),
        Some(kind) => Ok(kind),
    }
}

async fn render_form(
    state: &AppState,
    user: &str,
    year: i32,
    form: FormKind,
) -> Result<Response, ApiError> {
    let session = state.sessions.get(user, year).await?;
    let disposition = format!("attachment; filename=\"{}\"", form.file_name(year));
    let pdf = forms::render_blocking(
        session,
        form,
        state.rates.clone(),
        state.templates_dir.clone(),
    )
    .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        pdf,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use crate::openai::Message;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::str::FromStr;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XTAXBOUNDARY";

    const W2_TEXT: &str = "Form W-2 Wage and Tax Statement 2024\n\
        Employer's name: Acme Widgets Inc\n\
        1 Wages, tips, other compensation 50,000.00\n\
        2 Federal income tax withheld 6,000.00\n";

    struct CannedChat;

    #[async_trait::async_trait]
    impl ChatBackend for CannedChat {
        fn model(&self) -> &str {
            "canned-model"
        }

        async fn complete(&self, messages: Vec<Message>) -> anyhow::Result<String> {
            Ok(format!("Answered with {} messages.", messages.len()))
        }
    }

    fn state(assistant: Option<Arc<dyn ChatBackend>>) -> AppState {
        let rates = Arc::new(StateRateTable::embedded().unwrap());
        let profiles = ProfileStore::builtin().unwrap();
        AppState {
            sessions: SessionService::new(Arc::new(MemorySessionStore::new()), rates.clone()),
            extractor: Extractor::new(OcrRegistry::new(None), profiles.clone()),
            assistant,
            profiles,
            rates,
            auth: AuthConfig::new(None),
            templates_dir: None,
            max_upload_bytes: 1024 * 1024,
        }
    }

    fn app() -> Router {
        router(state(Some(Arc::new(CannedChat))))
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", "alice")
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        request(method, uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload_request(year: i32, filename: &str, content: &str, kind: Option<&str>) -> Request<Body> {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n{c}\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        );
        if let Some(kind) = kind {
            body.push_str(&format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"kind\"\r\n\r\n{k}\r\n",
                b = BOUNDARY,
                k = kind
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));

        request("POST", &format!("/sessions/{}/documents", year))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn decimal(value: &serde_json::Value) -> Decimal {
        Decimal::from_str(value.as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_profiles_are_listed() {
        let (status, json) = send(&app(), request("GET", "/profiles").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_requests_without_identity_are_rejected() {
        let req = Request::builder()
            .uri("/sessions/2024")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(&app(), req).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Missing credentials");
    }

    #[tokio::test]
    async fn test_open_and_fetch_session() {
        let app = app();

        let (status, opened) = send(
            &app,
            json_request("POST", "/sessions/2024", serde_json::json!({"filing_status": "head_of_household"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["filing_status"], "head_of_household");

        let (status, fetched) = send(&app, request("GET", "/sessions/2024").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], opened["id"]);

        let (status, _) = send(&app, request("GET", "/sessions/2023").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, list) = send(&app, request("GET", "/sessions").body(Body::empty()).unwrap()).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_session_without_body() {
        let (status, json) = send(&app(), request("POST", "/sessions/2024").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filing_status"], "single");
    }

    #[tokio::test]
    async fn test_open_session_rejects_bad_profile() {
        let app = app();

        let (status, json) = send(
            &app,
            json_request("POST", "/sessions/2024", serde_json::json!({"filing_status": "married"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Invalid JSON body"));

        let (status, _) = send(&app, request("GET", "/sessions/2024").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_profile_update_is_json_bad_request() {
        let (status, json) = send(
            &app(),
            json_request("PUT", "/sessions/2024/profile", serde_json::json!({"filing_status": "married"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("filing_status"));
    }

    #[tokio::test]
    async fn test_profile_update_without_content_type() {
        let req = request("PUT", "/sessions/2024/profile")
            .body(Body::from(r#"{"filing_status": "single"}"#))
            .unwrap();

        let (status, json) = send(&app(), req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_non_numeric_year_is_json_bad_request() {
        let (status, json) = send(&app(), request("GET", "/sessions/latest").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_payload_too_large() {
        let mut small = state(None);
        small.max_upload_bytes = 64;
        let app = router(small);

        let (status, json) = send(&app, upload_request(2024, "w2.txt", W2_TEXT, None)).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(json["error"].as_str().unwrap().starts_with("Upload too large"));
    }

    #[tokio::test]
    async fn test_out_of_range_year_is_rejected() {
        let (status, _) = send(&app(), request("GET", "/sessions/1066").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_w2_updates_refund() {
        let app = app();

        let (status, json) = send(&app, upload_request(2024, "w2.txt", W2_TEXT, None)).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["document"]["kind"], "W2");
        assert_eq!(json["document"]["attributes"]["employer_name"], "Acme Widgets Inc");
        assert_eq!(json["duplicate"], false);
        assert_eq!(decimal(&json["refund_estimate"]), dec!(1000));

        let (status, refund) = send(&app, request("GET", "/sessions/2024/refund").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&refund["breakdown"]["federal"]["tax"]), dec!(5000));
        assert_eq!(decimal(&refund["breakdown"]["federal"]["refund"]), dec!(1000));
        assert_eq!(decimal(&refund["refund_estimate"]), dec!(1000));
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_not_added_twice() {
        let app = app();
        let (_, first) = send(&app, upload_request(2024, "w2.txt", W2_TEXT, None)).await;

        let (status, again) = send(&app, upload_request(2024, "w2-copy.txt", W2_TEXT, None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["duplicate"], true);
        assert_eq!(again["document"]["id"], first["document"]["id"]);

        let (_, session) = send(&app, request("GET", "/sessions/2024").body(Body::empty()).unwrap()).await;
        assert_eq!(session["documents"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_with_kind_hint() {
        let (status, json) = send(
            &app(),
            upload_request(2024, "int.txt", "Interest income $312.40", Some("1099-INT")),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["document"]["kind"], "1099-INT");
        assert_eq!(decimal(&json["document"]["amounts"]["interest_income"]), dec!(312.40));
    }

    #[tokio::test]
    async fn test_unrecognized_upload_is_unprocessable() {
        let (status, json) = send(
            &app(),
            upload_request(2024, "note.txt", "Remember to buy milk", None),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("note.txt"));
    }

    #[tokio::test]
    async fn test_image_without_ocr_service_is_unprocessable() {
        let png = {
            let img = image::DynamicImage::ImageLuma8(image::GrayImage::new(4, 4));
            let mut buf = std::io::Cursor::new(Vec::new());
            img.write_to(&mut buf, image::ImageOutputFormat::Png).unwrap();
            buf.into_inner()
        };
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n",
            b = BOUNDARY
        )
        .into_bytes();
        body.extend_from_slice(&png);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        let req = request("POST", "/sessions/2024/documents")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, _) = send(&app(), req).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_manual_document_and_removal() {
        let app = app();

        let (status, added) = send(
            &app,
            json_request(
                "POST",
                "/sessions/2024/documents/manual",
                serde_json::json!({
                    "kind": "1099-NEC",
                    "amounts": {"nonemployee_compensation": "2000.00", "federal_withheld": 150},
                    "attributes": {"payer_name": "Client LLC"}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(decimal(&added["refund_estimate"]), dec!(-50));

        let doc_id = added["document"]["id"].as_str().unwrap();
        let (status, session) = send(
            &app,
            request("DELETE", &format!("/sessions/2024/documents/{}", doc_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(session["documents"].as_array().unwrap().is_empty());

        let (status, _) = send(
            &app,
            request("DELETE", &format!("/sessions/2024/documents/{}", doc_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_document_with_bad_kind() {
        let (status, _) = send(
            &app(),
            json_request(
                "POST",
                "/sessions/2024/documents/manual",
                serde_json::json!({"kind": "1040"}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_profile() {
        let (status, json) = send(
            &app(),
            json_request(
                "PUT",
                "/sessions/2024/profile",
                serde_json::json!({
                    "filing_status": "married_filing_jointly",
                    "dependents": [{"name": "Sam", "relationship": "child", "birth_year": 2016}]
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filing_status"], "married_filing_jointly");
        assert_eq!(json["dependents"][0]["name"], "Sam");
    }

    #[tokio::test]
    async fn test_chat_returns_backend_reply() {
        let (status, json) = send(
            &app(),
            json_request("POST", "/sessions/2024/chat", serde_json::json!({"question": "Do I owe?"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["reply"], "Answered with 3 messages.");
        assert_eq!(json["model"], "canned-model");
    }

    #[tokio::test]
    async fn test_chat_without_context() {
        let (_, json) = send(
            &app(),
            json_request(
                "POST",
                "/sessions/2024/chat",
                serde_json::json!({"question": "What is a W-2?", "include_context": false}),
            ),
        )
        .await;

        assert_eq!(json["reply"], "Answered with 2 messages.");
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_question() {
        let (status, _) = send(
            &app(),
            json_request("POST", "/sessions/2024/chat", serde_json::json!({"question": "  "})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_unavailable_without_backend() {
        let app = router(state(None));

        let (status, _) = send(
            &app,
            json_request("POST", "/sessions/2024/chat", serde_json::json!({"question": "Hi"})),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_form_downloads() {
        let app = app();
        send(&app, upload_request(2024, "w2.txt", W2_TEXT, None)).await;

        let response = app
            .clone()
            .oneshot(request("GET", "/sessions/2024/forms/1040").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"1040_2024.pdf\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"%PDF-"));

        let (status, _) = send(
            &app,
            request("GET", "/sessions/2024/forms/state/ca").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            request("GET", "/sessions/2024/forms/state/zz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_form_for_missing_session() {
        let (status, _) = send(
            &app(),
            request("GET", "/sessions/2024/forms/1040").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
