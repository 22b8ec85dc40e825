use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::AuthenticatedUser, config::StorageBackend, state::AppState};

pub mod crm;
pub mod documents;
pub mod health;
pub mod queues;
pub mod templates;

const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

pub(crate) fn timestamp(value: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(value, Utc).to_rfc3339()
}

fn cors_layer(allowed: Option<&String>) -> CorsLayer {
    let origin = match allowed {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = value, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_ref());

    let templates_routes = Router::new()
        .route(
            "/",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/:id",
            get(templates::get_template)
                .patch(templates::update_template)
                .delete(templates::delete_template),
        )
        .route("/:id/duplicate", post(templates::duplicate_template))
        .route("/:id/variables", get(templates::template_variables));

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::create_document),
        )
        .route("/:id", get(documents::get_document))
        .route("/:id/status", get(documents::document_status))
        .route("/:id/download", get(documents::download_document))
        .route("/:id/regenerate", post(documents::regenerate_document));

    let queues_routes = Router::new()
        .route("/stats", get(queues::queue_stats))
        .route("/cleanup", post(queues::schedule_cleanup))
        .route("/:name/pause", post(queues::pause_queue))
        .route("/:name/resume", post(queues::resume_queue));

    let crm_routes = Router::new()
        .route("/properties/:object_type", get(crm::list_properties))
        .route("/contacts/search", get(crm::search_contacts));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/templates", templates_routes)
        .nest("/api/documents", documents_routes)
        .nest("/api/queues", queues_routes)
        .nest("/api/crm", crm_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    let mut router = Router::new()
        .merge(protected_routes)
        .route("/api/health", get(health::health_check));

    if state.config.storage_backend == StorageBackend::Local {
        router = router.nest_service("/files", ServeDir::new(&state.config.storage_root));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
}
