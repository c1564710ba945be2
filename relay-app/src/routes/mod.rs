pub mod pages;

use axum::Router;

pub fn router() -> Router {
    Router::new().merge(pages::router())
}
