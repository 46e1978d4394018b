use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::Router;
use radio_core::config::ResolverConfig;
use radio_core::error::ResolveError;
use radio_core::resolver::{HttpProbe, StreamProbe};

const PLAYLIST: &str = "[playlist]\nNumberOfEntries=1\nFile1=http://example.invalid/live\n";

async fn serve() -> String {
    let app = Router::new()
        .route(
            "/stream",
            get(|| async { ([(header::CONTENT_TYPE, "audio/mpeg")], vec![0u8; 128 * 1024]) }),
        )
        .route(
            "/hls",
            get(|| async { ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], "#EXTM3U\n") }),
        )
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND.into_response() }))
        .route("/listen.pls", get(|| async { PLAYLIST }))
        .route("/moved.pls", get(|| async { Redirect::temporary("/listen.pls") }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn probe() -> HttpProbe {
    HttpProbe::new(&ResolverConfig::default(), None).unwrap()
}

#[tokio::test]
async fn audio_stream_is_reachable() {
    let base = serve().await;
    probe().check_reachable(&format!("{base}/stream")).await.unwrap();
}

#[tokio::test]
async fn mpegurl_content_type_is_accepted() {
    let base = serve().await;
    probe().check_reachable(&format!("{base}/hls")).await.unwrap();
}

#[tokio::test]
async fn html_page_is_not_a_stream() {
    let base = serve().await;
    let err = probe().check_reachable(&format!("{base}/page")).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotReachable { ref reason, .. } if reason.contains("text/html")));
}

#[tokio::test]
async fn http_error_is_not_reachable() {
    let base = serve().await;
    let err = probe().check_reachable(&format!("{base}/missing")).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotReachable { ref reason, .. } if reason.contains("404")));
}

#[tokio::test]
async fn connection_refused_is_not_reachable() {
    let err = probe()
        .check_reachable("http://127.0.0.1:1/stream")
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NotReachable { .. }));
}

#[tokio::test]
async fn playlist_fetch_follows_redirects_on_retry() {
    let base = serve().await;
    let p = probe();
    assert_eq!(p.fetch_playlist(&format!("{base}/listen.pls")).await.unwrap(), PLAYLIST);
    assert_eq!(p.fetch_playlist(&format!("{base}/moved.pls")).await.unwrap(), PLAYLIST);
    assert!(p.fetch_playlist(&format!("{base}/missing")).await.is_err());
}

#[tokio::test]
async fn decode_check_without_ffmpeg_fails_cleanly() {
    let base = serve().await;
    let err = probe().check_audio(&format!("{base}/stream")).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotValidAudio { .. }));
}
