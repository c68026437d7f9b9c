use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use supervisor::Controller;

use super::services;

pub fn add_routes(router: Router, controller: Arc<Controller>, max_body_size: usize) -> Router {
    // Local dashboards are served from other ports, so any origin may call in.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_origin(AllowOrigin::mirror_request());

    let api = Router::new()
        .route(
            "/services",
            get(services::list_services).post(services::add_service),
        )
        .route("/services/start-all", post(services::start_all))
        .route("/services/stop-all", post(services::stop_all))
        .route("/services/restart-all", post(services::restart_all))
        .route("/services/adopt", post(services::adopt_running))
        .route(
            "/services/:name",
            get(services::get_service)
                .put(services::update_service)
                .delete(services::remove_service),
        )
        .route("/services/:name/start", post(services::start))
        .route("/services/:name/stop", post(services::stop))
        .route("/services/:name/restart", post(services::restart))
        .route(
            "/services/:name/logs",
            get(services::get_log).delete(services::clear_log),
        )
        .route("/logs", axum::routing::delete(services::clear_all_logs))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(controller);

    router
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index)) // Axum answering is all liveness means here
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn index() -> &'static str {
    "process supervisor"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use supervisor::{ConfigSnapshot, DefinitionStore, JsonFileStore};

    #[tokio::test]
    async fn index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("services.json")));
        store.save(&ConfigSnapshot::default()).await.unwrap();
        let controller = Arc::new(Controller::new(store, dir.path()).await.unwrap());

        let app = add_routes(Router::new(), controller, 1_000_000);

        for uri in ["/", "/_readiness", "/_liveness"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"process supervisor");
        }
    }
}
