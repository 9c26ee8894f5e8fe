use std::path::PathBuf;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use axum_byteranges::{KnownSize, Ranged, RangeSetHeader};

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
}

async fn get_file(
    RangeSetHeader(ranges): RangeSetHeader,
    Query(query): Query<FileRequest>,
) -> impl IntoResponse {
    let path = PathBuf::from(&query.path);
    match KnownSize::file(&path).await {
        Ok(body) => {
            let content_type = body.content_type();
            Ranged::new(ranges, body, content_type).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, format!("cannot open {}: {e}", path.display()))
            .into_response(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/file", get(get_file));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, router).await.unwrap();
}
