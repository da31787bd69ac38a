//! Host build of the shutter controller: the engine behind an axum HTTP
//! server, a software stepper instead of motor hardware, and files instead
//! of flash storage.

use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use shutter_common::{
    ota::ImageKind, ApiError, ByteStore, CalibrateCommand, FirmwareConfigPatch, LinkInfo,
    MirrorStore, MoveCommand, NetworkLink, SettingsPatch, ShutterConfig, ShutterEngine,
    SoftStepper, StateStore, StoreError, UpdateLatestRequest, UpdateReleaseRequest,
    UpdateUrlRequest,
};

const TICK_INTERVAL_MS: u64 = 20;
const RELEASE_HOST: &str = "github.com:443";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<ShutterEngine<SoftStepper>>>,
    link: Arc<Mutex<HostLink>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct FirmwareConfigView {
    ok: bool,
    #[serde(rename = "firmwareRepo")]
    firmware_repo: String,
    #[serde(rename = "firmwareAssetName")]
    firmware_asset_name: String,
    #[serde(rename = "firmwareFsAssetName")]
    firmware_fs_asset_name: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SHUTTER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.shutter"));

    let cfg = ShutterConfig::default();
    let store = StateStore::new(
        Box::new(FileByteStore::new(data_dir.join("state.bin"))),
        Some(Box::new(FileMirrorStore::new(data_dir.join("state.json")))),
        cfg.save_interval_ms,
    );
    let engine = ShutterEngine::new(cfg, SoftStepper::new(), store);
    info!("state loaded from {:?}", engine.load_source());

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        link: Arc::new(Mutex::new(HostLink::new(&data_dir))),
    };

    spawn_tick_loop(app_state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/state", get(handle_get_state))
        .route("/api/move", post(handle_move))
        .route("/api/calibrate", post(handle_calibrate))
        .route("/api/settings", post(handle_settings))
        .route(
            "/api/firmware/config",
            get(handle_get_firmware_config).post(handle_post_firmware_config),
        )
        .route("/api/firmware/check/latest", post(handle_check_latest))
        .route("/api/firmware/update/latest", post(handle_update_latest))
        .route("/api/firmware/update/release", post(handle_update_release))
        .route("/api/firmware/update/url", post(handle_update_url))
        .route("/api/wifi/reset", post(handle_wifi_reset))
        .route("/api/system/reboot", post(handle_reboot))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("SHUTTER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("shutter controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_tick_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        let mut last_persist_error: Option<String> = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let outcome = {
                let mut engine = app_state.engine.lock().await;
                let wall = now_in_timezone(&engine.state().timezone);
                let mut link = app_state.link.lock().await;
                engine.tick(now_ms, wall, &mut *link)
            };

            // Log a save failure once per distinct error, not per tick.
            if outcome.persist_error != last_persist_error {
                if let Some(err) = &outcome.persist_error {
                    warn!("state save failed: {err}");
                }
                last_persist_error = outcome.persist_error;
            }

            if outcome.reboot_due {
                info!("restart requested; exiting so the supervisor relaunches");
                std::process::exit(0);
            }
        }
    });
}

async fn status_response(state: &AppState) -> axum::response::Response {
    let now_ms = monotonic_ms();
    let mut engine = state.engine.lock().await;
    let wall = now_in_timezone(&engine.state().timezone);
    let mut link = state.link.lock().await;
    Json(engine.status(now_ms, wall, &mut *link)).into_response()
}

async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    status_response(&state).await
}

async fn handle_move(
    State(state): State<AppState>,
    Json(cmd): Json<MoveCommand>,
) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        engine.handle_move(cmd, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_calibrate(
    State(state): State<AppState>,
    Json(cmd): Json<CalibrateCommand>,
) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        engine.handle_calibrate(cmd, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> impl IntoResponse {
    // The engine checks everything else; IANA zone names are a host concern.
    if let Some(tz) = &patch.timezone {
        if tz.trim().parse::<Tz>().is_err() {
            return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
        }
    }

    let result = {
        let mut engine = state.engine.lock().await;
        engine.handle_settings(patch, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_get_firmware_config(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    let s = engine.state();
    Json(FirmwareConfigView {
        ok: true,
        firmware_repo: s.firmware_repo.clone(),
        firmware_asset_name: s.firmware_asset_name.clone(),
        firmware_fs_asset_name: s.firmware_fs_asset_name.clone(),
    })
}

async fn handle_post_firmware_config(
    State(state): State<AppState>,
    Json(patch): Json<FirmwareConfigPatch>,
) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        engine.set_firmware_config(patch, monotonic_ms())
    };
    match result {
        Ok(()) => handle_get_firmware_config(State(state)).await.into_response(),
        Err(err) => api_error_response(&err),
    }
}

async fn handle_check_latest(
    State(state): State<AppState>,
    body: Option<Json<UpdateLatestRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let check = {
        let mut engine = state.engine.lock().await;
        let mut link = state.link.lock().await;
        engine.check_update_latest(request.include_filesystem, &mut *link)
    };
    let status = if check.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(check)).into_response()
}

async fn handle_update_latest(
    State(state): State<AppState>,
    body: Option<Json<UpdateLatestRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let result = {
        let mut engine = state.engine.lock().await;
        engine.enqueue_update_latest(request, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_update_release(
    State(state): State<AppState>,
    Json(request): Json<UpdateReleaseRequest>,
) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        engine.enqueue_update_release(request, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_update_url(
    State(state): State<AppState>,
    Json(request): Json<UpdateUrlRequest>,
) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        engine.enqueue_update_url(request, monotonic_ms())
    };
    match result {
        Ok(()) => status_response(&state).await,
        Err(err) => api_error_response(&err),
    }
}

async fn handle_wifi_reset(State(state): State<AppState>) -> impl IntoResponse {
    let result = {
        let mut engine = state.engine.lock().await;
        let mut link = state.link.lock().await;
        engine.reset_network_credentials(&mut *link)
    };
    match result {
        Ok(()) => Json(OkBody { ok: true }).into_response(),
        Err(err) => api_error_response(&err),
    }
}

async fn handle_reboot(State(state): State<AppState>) -> impl IntoResponse {
    {
        let mut engine = state.engine.lock().await;
        engine.request_reboot();
    }
    Json(OkBody { ok: true })
}

/// Primary store backed by a single binary file.
struct FileByteStore {
    path: PathBuf,
}

impl FileByteStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ByteStore for FileByteStore {
    fn read(&mut self) -> Result<Vec<u8>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        std::fs::write(&self.path, bytes).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

struct FileMirrorStore {
    path: PathBuf,
}

impl FileMirrorStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MirrorStore for FileMirrorStore {
    fn read(&mut self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn write(&mut self, text: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        std::fs::write(&self.path, text).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

/// Network collaborator for the host build. Reachability is a real TCP
/// probe; image staging accepts `file://` sources only, since there is no
/// flash partition to write on a host.
struct HostLink {
    staging_dir: PathBuf,
    wifi_path: PathBuf,
}

impl HostLink {
    fn new(data_dir: &std::path::Path) -> Self {
        Self {
            staging_dir: data_dir.join("staging"),
            wifi_path: data_dir.join("wifi.json"),
        }
    }
}

impl NetworkLink for HostLink {
    fn is_connected(&mut self) -> bool {
        self.probe_release_host().is_ok()
    }

    fn link_info(&mut self) -> LinkInfo {
        LinkInfo {
            connected: true,
            ssid: String::new(),
            rssi: 0,
            ip: local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }

    fn probe_release_host(&mut self) -> Result<(), String> {
        let addrs = RELEASE_HOST
            .to_socket_addrs()
            .map_err(|err| format!("resolve failed: {err}"))?;
        let mut last_error = "no addresses resolved".to_string();
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(err) => last_error = format!("connect failed: {err}"),
            }
        }
        Err(last_error)
    }

    fn fetch_image(&mut self, url: &str, kind: ImageKind) -> Result<(), String> {
        let Some(source) = url.strip_prefix("file://") else {
            return Err("only file:// image sources can be staged on a host build".to_string());
        };
        let bytes =
            std::fs::read(source).map_err(|err| format!("read {source} failed: {err}"))?;

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|err| format!("staging dir: {err}"))?;
        let dest = self.staging_dir.join(format!("{}.bin", kind.as_str()));
        std::fs::write(&dest, &bytes).map_err(|err| format!("stage {dest:?} failed: {err}"))?;

        let digest = Sha256::digest(&bytes)
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        info!(
            "staged {} image ({} bytes, sha256 {digest})",
            kind.as_str(),
            bytes.len()
        );
        Ok(())
    }

    fn reset_credentials(&mut self) -> Result<(), String> {
        match std::fs::remove_file(&self.wifi_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(format!("failed to clear credentials: {err}")),
        }
    }
}

/// Local address as seen on the default route; no packets are sent.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn api_error_response(err: &ApiError) -> axum::response::Response {
    let status = match err {
        ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        ApiError::Conflict(_) => StatusCode::CONFLICT,
        ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
