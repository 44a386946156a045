//! Helpers for testing the disk cache and the command line driver.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache would lazily create its base
//!    directory again and leak it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using a [`Server`], make sure that the server is held until all requests to it have
//!    been made. Dropping the server stops serving, and all further connections to it fail.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `immcache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("immcache=trace,immcache_cli=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Generates `count` resources with distinct, random content.
///
/// Resources are named `resource-{i}` and are between 8 and `max_len` bytes large. The same
/// `seed` always generates the same resources.
pub fn random_resources(count: usize, max_len: usize, seed: u64) -> Vec<(String, Vec<u8>)> {
    assert!(max_len >= 8, "resources need room for a unique prefix");
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|i| {
            let mut content = vec![0; rng.random_range(8..=max_len)];
            rng.fill_bytes(&mut content);
            // distinct content, even for identical random bytes
            content[..8].copy_from_slice(&(i as u64).to_le_bytes());
            (format!("resource-{i}"), content)
        })
        .collect()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
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

type Files = Arc<BTreeMap<String, Bytes>>;

/// An HTTP server for in-memory files that counts the requests it receives.
///
/// Routes:
///  - `/files/{name}` responds with the file and its `Content-Length`.
///  - `/chunked/{name}` streams the file in small chunks without a `Content-Length`.
///  - `/respond_statuscode/{num}` responds with an empty body and the given status code.
pub struct FileServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl FileServer {
    pub fn new<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Bytes>,
    {
        let files: Files = Arc::new(
            files
                .into_iter()
                .map(|(name, content)| (name.into(), content.into()))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/files/:name", get(serve_file))
            .route("/chunked/:name", get(serve_chunked))
            .route(
                "/respond_statuscode/:num",
                get(|extract::Path(num): extract::Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .layer(middleware::from_fn(hitcounter))
            .with_state(files);

        Self {
            server: Server::with_router(router),
            hits,
        }
    }

    /// The number of requests to `path` since the server was started.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }

    /// The total number of requests since the server was started.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

async fn serve_file(
    extract::State(files): extract::State<Files>,
    extract::Path(name): extract::Path<String>,
) -> Response {
    match files.get(&name) {
        Some(content) => content.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_chunked(
    extract::State(files): extract::State<Files>,
    extract::Path(name): extract::Path<String>,
) -> Response {
    let Some(content) = files.get(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let chunks: Vec<_> = content
        .chunks(7)
        .map(|chunk| Ok::<_, Infallible>(Bytes::copy_from_slice(chunk)))
        .collect();
    let body = Body::from_stream(futures::stream::iter(chunks));
    ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
}
