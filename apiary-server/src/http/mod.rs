//! HTTP server module

mod api;
mod dispatch;

use std::collections::BTreeMap;
use std::sync::Arc;

use apiary_core::{Command, HttpMethod};
use axum::{
    Router, middleware,
    routing::{MethodFilter, MethodRouter, get},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{AppState, middleware::require_identity, ws};

pub use api::HealthResponse;

/// Create the HTTP router with all routes configured
///
/// Every catalog command is mounted at `/api` + its route. Commands other
/// than login and register sit behind [`require_identity`].
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = catalog_routes(|command| command.requires_auth()).route_layer(
        middleware::from_fn_with_state(state.clone(), require_identity),
    );
    let public = catalog_routes(|command| !command.requires_auth())
        .route("/health", get(api::health));

    Router::new()
        .nest("/api", public.merge(protected))
        .route("/ws", get(ws::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn catalog_routes(include: impl Fn(Command) -> bool) -> Router<Arc<AppState>> {
    let mut paths: BTreeMap<&'static str, MethodRouter<Arc<AppState>>> = BTreeMap::new();

    for &command in Command::ALL.iter().filter(|&&c| include(c)) {
        let route = command.route();
        let handler = move |state, identity, path, query, body| {
            dispatch::handle(command, state, identity, path, query, body)
        };
        let methods = paths.remove(route.path).unwrap_or_else(MethodRouter::new);
        paths.insert(route.path, methods.on(method_filter(route.method), handler));
    }

    paths
        .into_iter()
        .fold(Router::new(), |router, (path, methods)| router.route(path, methods))
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Delete => MethodFilter::DELETE,
    }
}
