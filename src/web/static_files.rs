use axum::{
    body::Body,
    extract::Path,
    http::{header, Response, StatusCode},
};
use rust_embed::Embed;

/// Bundled browser client
#[derive(Embed)]
#[folder = "web/dist"]
pub struct StaticAssets;

/// Scripts the client page loads; nothing else under `/js` is served
pub const CLIENT_SCRIPTS: [&str; 3] = ["main.js", "webrtc.js", "constants.js"];

/// Serve the client page
pub async fn index_handler() -> Response<Body> {
    serve_file("index.html")
}

/// Serve one of the whitelisted client scripts
pub async fn script_handler(Path(name): Path<String>) -> Response<Body> {
    if !CLIENT_SCRIPTS.contains(&name.as_str()) {
        tracing::debug!("Unknown script requested: {}", name);
        return not_found();
    }
    serve_file(&format!("js/{}", name))
}

fn serve_file(path: &str) -> Response<Body> {
    let Some(asset) = StaticAssets::get(path) else {
        tracing::warn!("Bundled asset missing: {}", path);
        return not_found();
    };

    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    let mut response = Response::new(Body::from(asset.data.into_owned()));
    let headers = response.headers_mut();
    if let Ok(value) = mime.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    response
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::from("Not Found"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
