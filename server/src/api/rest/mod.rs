//! REST API module
//!
//! Organized into domain-specific submodules for maintainability.

mod admin;
mod auth;
mod error;
mod files;
mod sharing;
mod types;

use crate::api::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub use admin::admin_routes;
pub use auth::{auth_routes, login_routes};
pub use error::AppError;
pub use files::file_routes;
pub use sharing::share_routes;

/// Every route except login.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(auth_routes())
        .merge(file_routes())
        .merge(share_routes())
        .merge(admin_routes())
}

/// The application without rate limiting, CORS or tracing.
pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.max_upload_bytes as usize);
    Router::new()
        .merge(login_routes())
        .merge(api_routes())
        .layer(body_limit)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let cors_origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!("CORS allowed origins: {:?}", cors_origins);

    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
        .allow_credentials(true)
        .expose_headers(vec![
            header::HeaderName::from_static("x-request-id"),
            header::CONTENT_DISPOSITION,
        ]);

    let body_limit = DefaultBodyLimit::max(state.config.max_upload_bytes as usize);

    // Login: bursts of 5, then one attempt every 2 seconds per client IP
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(5)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid login rate limit"))?,
    );
    let login = login_routes().layer(GovernorLayer {
        config: governor_config,
    });

    let x_request_id = header::HeaderName::from_static("x-request-id");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(false).level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let app = Router::new()
        .merge(login)
        .merge(api_routes())
        .layer(cors)
        .layer(body_limit)
        // Request ID: Generate UUID, set on request, propagate to response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    // The login rate limiter keys on the peer address
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_token, Role};
    use crate::config::Config;
    use crate::db::{ShareStore, UserStore};
    use crate::storage::{FileOps, PathGuard};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use std::fs;
    use std::io::Read;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "skybit-test-boundary";

    struct TestApp {
        _temp: TempDir,
        root: PathBuf,
        data: PathBuf,
        state: AppState,
    }

    fn test_app() -> TestApp {
        let temp = tempdir().unwrap();
        let root = temp.path().join("root");
        let data = temp.path().join("data");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join("inbox")).unwrap();
        fs::write(root.join("docs/report.txt"), b"quarterly numbers").unwrap();
        fs::write(root.join("docs/plan.md"), b"# plan").unwrap();
        fs::create_dir_all(&data).unwrap();

        let config = Config::for_tests(root.clone(), data.clone());
        let guard = PathGuard::new(&root).unwrap();
        let root = guard.root().to_path_buf();
        let files = FileOps::new(guard, config.scratch_directory(), config.max_archive_bytes);
        let shares = Arc::new(ShareStore::open(&data).unwrap());
        let users = Arc::new(UserStore::open(&data).unwrap());
        users.create("boss", "bosspass", Role::Admin).unwrap();
        users.create("editor", "editorpass", Role::Moderator).unwrap();
        users.create("viewer", "viewerpass", Role::User).unwrap();

        let state = AppState::new(config, files, shares, users);
        TestApp {
            _temp: temp,
            root,
            data,
            state,
        }
    }

    impl TestApp {
        fn token(&self, username: &str, role: Role) -> String {
            create_token(&self.state.config.jwt_secret, username, role).unwrap()
        }

        async fn send(&self, request: Request<Body>) -> Response {
            router(self.state.clone()).oneshot(request).await.unwrap()
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.send(request).await;
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }
    }

    fn multipart_body(folder: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"current_folder\"\r\n\r\n{}\r\n",
                BOUNDARY, folder
            )
            .as_bytes(),
        );
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, name
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_and_me() {
        let app = test_app();

        let (status, body) = app
            .call(
                "POST",
                "/auth/login",
                None,
                Some(json!({"username": "Editor", "password": "editorpass"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "editor");
        assert_eq!(body["role"], "mod");

        let token = body["token"].as_str().unwrap().to_string();
        let (status, me) = app.call("GET", "/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["username"], "editor");

        let (status, _) = app
            .call(
                "POST",
                "/auth/login",
                None,
                Some(json!({"username": "editor", "password": "nope"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_listing_requires_a_session() {
        let app = test_app();
        let (status, body) = app.call("GET", "/files/list?path=docs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let viewer = app.token("viewer", Role::User);
        let (status, body) = app
            .call("GET", "/files/list?path=docs", Some(&viewer), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"], json!(["plan.md", "report.txt"]));
    }

    #[tokio::test]
    async fn test_traversal_is_a_bad_request() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);
        let (status, _) = app
            .call("GET", "/files/list?path=../../etc", Some(&viewer), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_role_is_read_from_registry() {
        let app = test_app();

        // A token claiming admin does not grant more than the stored role
        let forged = app.token("viewer", Role::Admin);
        let (status, _) = app
            .call("POST", "/files/delete", Some(&forged), Some(json!({"path": "docs"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(app.root.join("docs").is_dir());

        app.state.users.delete("editor").unwrap();
        let stale = app.token("editor", Role::Moderator);
        let (status, _) = app.call("GET", "/auth/me", Some(&stale), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_uniquifies_names() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);

        let body = multipart_body("inbox", &[("notes.txt", b"one"), ("notes.txt", b"two")]);
        let response = app.send(upload_request("/files/upload", &editor, body)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["saved"], json!(["inbox/notes.txt", "inbox/notes (1).txt"]));
        assert_eq!(report["failed"], json!([]));
        assert_eq!(fs::read(app.root.join("inbox/notes (1).txt")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_upload_with_nothing_saved_is_an_error() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);

        let body = multipart_body("inbox", &[("..", b"x")]);
        let response = app.send(upload_request("/files/upload", &editor, body)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["failed"], json!([".."]));
    }

    #[tokio::test]
    async fn test_upload_needs_moderator() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);
        let body = multipart_body("inbox", &[("a.txt", b"a")]);
        let response = app.send(upload_request("/files/upload", &viewer, body)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!app.root.join("inbox/a.txt").exists());
    }

    #[tokio::test]
    async fn test_entry_operations() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);

        let (status, body) = app
            .call("POST", "/files/folder", Some(&editor), Some(json!({"parent": "", "name": "Music"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["path"], "Music");

        let (status, _) = app
            .call("POST", "/files/folder", Some(&editor), Some(json!({"parent": "", "name": "Music"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app
            .call(
                "POST",
                "/files/move",
                Some(&editor),
                Some(json!({"source": "docs/report.txt", "destination": "Music"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["path"], "Music/report.txt");

        let (status, _) = app
            .call(
                "POST",
                "/files/rename",
                Some(&editor),
                Some(json!({"path": "Music/report.txt", "new_name": "q3.txt"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .call(
                "PUT",
                "/files/content",
                Some(&editor),
                Some(json!({"path": "Music/q3.txt", "content": "updated"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fs::read_to_string(app.root.join("Music/q3.txt")).unwrap(), "updated\n");

        let (status, _) = app
            .call("POST", "/files/delete", Some(&editor), Some(json!({"path": "Music"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.root.join("Music").exists());
    }

    #[tokio::test]
    async fn test_preview() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);

        let (status, body) = app
            .call("GET", "/files/preview?path=docs/plan.md", Some(&viewer), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"kind": "text", "content": "# plan"}));

        let (status, _) = app
            .call("GET", "/files/preview?path=docs", Some(&viewer), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app.call("GET", "/files/preview?path=docs/plan.md", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_folder_download_streams_zip_and_cleans_up() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);

        let request = Request::builder()
            .uri("/files/download?path=docs")
            .header(header::AUTHORIZATION, format!("Bearer {}", viewer))
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("docs.zip"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut content = String::new();
        archive
            .by_name("report.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "quarterly numbers");

        let scratch = app.state.config.scratch_directory();
        let leftovers = fs::read_dir(&scratch).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_file_download() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);

        let request = Request::builder()
            .uri("/files/download?path=docs/plan.md")
            .header(header::AUTHORIZATION, format!("Bearer {}", viewer))
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "6");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"# plan");
    }

    #[tokio::test]
    async fn test_share_lifecycle() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);
        let boss = app.token("boss", Role::Admin);

        let (status, share) = app
            .call(
                "POST",
                "/shares",
                Some(&editor),
                Some(json!({"path": "docs", "expires_in_minutes": 5})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(share["is_folder"], true);
        let token = share["token"].as_str().unwrap().to_string();
        assert_eq!(share["url"], format!("/share/{}", token));

        let (status, info) = app.call("GET", &format!("/share/{}", token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["name"], "docs.zip");
        assert_eq!(info["minutes_remaining"], 5);

        let request = Request::builder()
            .uri(format!("/share/{}/download", token))
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (status, listed) = app.call("GET", "/shares", Some(&editor), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(listed["error"].is_string());

        let (status, listed) = app.call("GET", "/shares", Some(&boss), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = app
            .call(
                "PATCH",
                &format!("/shares/{}", token),
                Some(&boss),
                Some(json!({"expires_in_minutes": 90})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .call("DELETE", &format!("/shares/{}", token), Some(&boss), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.data.join("shares").join(&token).exists());

        let (status, _) = app.call("GET", &format!("/share/{}", token), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_expired_and_unknown_shares_look_the_same() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);

        let (status, share) = app
            .call(
                "POST",
                "/shares",
                Some(&editor),
                Some(json!({"path": "docs/report.txt", "expires_in_minutes": 0})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = share["token"].as_str().unwrap();

        let expired = app.call("GET", &format!("/share/{}", token), None, None).await;
        let unknown = app.call("GET", "/share/not-a-real-token", None, None).await;
        assert_eq!(expired.0, StatusCode::NOT_FOUND);
        assert_eq!(expired, unknown);
    }

    #[tokio::test]
    async fn test_share_too_large() {
        let app = test_app();
        let editor = app.token("editor", Role::Moderator);
        fs::write(app.root.join("docs/huge.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();

        let (status, _) = app
            .call("POST", "/shares", Some(&editor), Some(json!({"path": "docs"})))
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_admin_user_management() {
        let app = test_app();
        let boss = app.token("boss", Role::Admin);

        let (status, created) = app
            .call(
                "POST",
                "/admin/users",
                Some(&boss),
                Some(json!({"username": "Guest", "password": "guestpass", "role": "user"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["username"], "guest");

        let (status, updated) = app
            .call(
                "PATCH",
                "/admin/users/guest",
                Some(&boss),
                Some(json!({"role": "moderator", "password": ""})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["role"], "mod");
        assert!(app.state.users.verify("guest", "guestpass").is_ok());

        let (status, _) = app.call("DELETE", "/admin/users/boss", Some(&boss), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app.call("DELETE", "/admin/users/guest", Some(&boss), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.state.users.get("guest").is_none());
    }

    #[tokio::test]
    async fn test_change_password() {
        let app = test_app();
        let viewer = app.token("viewer", Role::User);

        let (status, _) = app
            .call(
                "POST",
                "/auth/password",
                Some(&viewer),
                Some(json!({"current_password": "wrong", "new_password": "fresh-pass"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call(
                "POST",
                "/auth/password",
                Some(&viewer),
                Some(json!({"current_password": "viewerpass", "new_password": "fresh-pass"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.state.users.verify("viewer", "fresh-pass").is_ok());
    }

    #[tokio::test]
    async fn test_server_info_is_public() {
        let app = test_app();
        let (status, info) = app.call("GET", "/server/info", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["name"], "Skybit Test");
    }
}
