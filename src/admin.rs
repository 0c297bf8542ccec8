use crate::error::{error_response, json_error_response, ApiErrorCode};
use crate::process::ProcessManager;
use crate::provision::Provisioner;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the control API
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything a request handler needs
pub struct AdminState {
    pub process_manager: Arc<ProcessManager>,
    pub provisioner: Arc<Provisioner>,
    pub auth_token: String,
    pub max_upload_bytes: u64,
    pub default_log_lines: i64,
}

/// Control API server for provisioning and supervision
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control API connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Route one request. `/health` and `/version` are public, everything under
/// `/api/` requires the bearer token.
pub async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (_, p) if p.starts_with("/api/") => {
            if check_auth(&req, &state.auth_token) {
                route_api(req, &method, &path, &state).await
            } else {
                warn!(%path, "Unauthorized control API request");
                json_error_response(ApiErrorCode::Unauthorized, "unauthorized")
            }
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn route_api<B>(
    req: Request<B>,
    method: &Method,
    path: &str,
    state: &AdminState,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match (method, path) {
        (&Method::GET, "/api/servers") => {
            let servers = state.process_manager.list();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": servers.len(),
                    "servers": servers,
                }),
            )
        }

        (&Method::GET, "/api/frpc/version") => frpc_version(state).await,

        (&Method::GET, "/api/frpc/latest") => match state.provisioner.latest_version().await {
            Ok(version) => json_response(StatusCode::OK, serde_json::json!({ "version": version })),
            Err(e) => {
                warn!(error = %e, "Failed to resolve latest frpc release");
                error_response(&e)
            }
        },

        (&Method::POST, "/api/frpc/install") => match state.provisioner.install_from_network().await {
            Ok(version) => installed(version),
            Err(e) => {
                error!(error = %e, "frpc install failed");
                error_response(&e)
            }
        },

        (&Method::POST, "/api/frpc/upload") => {
            let body = match read_body(req.into_body(), state.max_upload_bytes).await {
                Ok(body) => body,
                Err(rejection) => return rejection,
            };
            match state.provisioner.install_from_blob(&body[..]).await {
                Ok(version) => installed(version),
                Err(e) => {
                    error!(error = %e, bytes = body.len(), "frpc upload install failed");
                    error_response(&e)
                }
            }
        }

        _ => match path
            .strip_prefix("/api/servers/")
            .and_then(|rest| rest.split_once('/'))
        {
            Some((server_id, action)) => server_action(req, method, server_id, action, state).await,
            None => json_error_response(ApiErrorCode::NotFound, "not found"),
        },
    }
}

async fn server_action<B>(
    req: Request<B>,
    method: &Method,
    server_id: &str,
    action: &str,
    state: &AdminState,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let manager = &state.process_manager;

    match (method, action) {
        (&Method::POST, "start") => {
            let body = match read_body(req.into_body(), state.max_upload_bytes).await {
                Ok(body) => body,
                Err(rejection) => return rejection,
            };
            let config_text = match String::from_utf8(body.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    return json_error_response(ApiErrorCode::BadRequest, "configuration must be UTF-8 text")
                }
            };
            match manager.start(server_id, &config_text).await {
                Ok(pid) => json_response(
                    StatusCode::OK,
                    serde_json::json!({ "status": "started", "pid": pid }),
                ),
                Err(e) => {
                    warn!(server_id, error = %e, "Start rejected");
                    error_response(&e)
                }
            }
        }

        (&Method::POST, "stop") => match manager.stop(server_id).await {
            Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "status": "stopped" })),
            Err(e) => error_response(&e),
        },

        (&Method::GET, "status") => {
            let (running, pid) = manager.status(server_id);
            json_response(StatusCode::OK, serde_json::json!({ "running": running, "pid": pid }))
        }

        (&Method::GET, "logs") => {
            let lines = requested_lines(&req, state.default_log_lines);
            match manager.tail_logs(server_id, lines).await {
                Ok(logs) => json_response(StatusCode::OK, serde_json::json!({ "logs": logs })),
                Err(e) => error_response(&e),
            }
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    }
}

async fn frpc_version(state: &AdminState) -> Response<Full<Bytes>> {
    if !state.provisioner.is_installed() {
        return json_response(
            StatusCode::OK,
            serde_json::json!({ "installed": false, "version": null }),
        );
    }
    match state.provisioner.current_version().await {
        Ok(version) => json_response(
            StatusCode::OK,
            serde_json::json!({ "installed": true, "version": version }),
        ),
        Err(e) => error_response(&e),
    }
}

fn installed(version: String) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "installed", "version": version }),
    )
}

/// `lines` query parameter, falling back to `default` when absent or unparseable
fn requested_lines<B>(req: &Request<B>, default: i64) -> i64 {
    req.uri()
        .query()
        .and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "lines")
                .and_then(|(_, value)| value.parse().ok())
        })
        .unwrap_or(default)
}

/// Collect a request body of at most `limit` bytes
async fn read_body<B>(body: B, limit: u64) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(json_error_response(
            ApiErrorCode::PayloadTooLarge,
            format!("request body exceeds {} bytes", limit),
        )),
        Err(e) => Err(json_error_response(
            ApiErrorCode::BadRequest,
            format!("failed to read request body: {}", e),
        )),
    }
}
