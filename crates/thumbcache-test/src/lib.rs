//! Helpers for testing the thumbcache service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory
//!    is held for the entire lifetime of the test. When dropped too early,
//!    this might silently leak the temp directory, since the cache will
//!    create it again lazily after it has been deleted. To avoid this, assign
//!    it to a variable in the test function (e.g. `let _cache_dir =
//!    test::tempdir()`).
//!
//!  - When using [`ImageServer`], make sure that the server is held until all
//!    requests to it have been made. If the server is dropped, the ports
//!    remain open and all connections to it will time out. To avoid this,
//!    assign it to a variable: `let server = test::ImageServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{OriginalUri, Path, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the
///    `thumbcache_service` crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("thumbcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a
/// `tokio::test`. It automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Files = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// An HTTP server for image fixtures that counts hits per URI.
///
/// Bodies registered via [`insert`](Self::insert) are served under
/// `/images/<path>`, and with an artificial delay under
/// `/slow/<duration>/<path>`. Unknown paths return `404`.
pub struct ImageServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    files: Files,
}

impl ImageServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let files: Files = Default::default();

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/images/*path",
                get({
                    let files = files.clone();
                    move |Path(path): Path<String>| {
                        let files = files.clone();
                        async move { serve(&files, &path) }
                    }
                }),
            )
            .route(
                "/slow/:time/*path",
                get({
                    let files = files.clone();
                    move |Path((time, path)): Path<(String, String)>| {
                        let files = files.clone();
                        async move {
                            let duration = humantime::parse_duration(&time).unwrap();
                            tokio::time::sleep(duration).await;

                            serve(&files, &path)
                        }
                    }
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(|Path((num, _)): Path<(u16, String)>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self {
            server,
            hits,
            files,
        }
    }

    /// Registers an image body, served under `/images/<path>`.
    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(path.into(), bytes.into());
    }

    /// Total number of requests served so far, draining the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// All per-URI hit counts so far, draining the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// A full URL for the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The URL serving the image registered under `path`.
    pub fn image_url(&self, path: &str) -> Url {
        self.server.url(&format!("images/{path}"))
    }

    /// The URL serving the image registered under `path` after an artificial
    /// delay, e.g. `slow_url("200ms", "it.png")`.
    pub fn slow_url(&self, delay: &str, path: &str) -> Url {
        self.server.url(&format!("slow/{delay}/{path}"))
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

fn serve(files: &Files, path: &str) -> Response {
    match files.lock().unwrap().get(path) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
