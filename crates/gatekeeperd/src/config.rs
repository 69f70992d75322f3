use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus to expose the D-Bus interface on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
    Off,
}

/// Push-notification settings. Present only when both the gateway URL
/// and the device token are configured.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Base URL of the notification API (`{api_url}/send_notification/`).
    pub api_url: String,
    /// Device token of the phone that receives visitor alerts.
    pub device_token: String,
    /// Minimum time between two outbound notifications.
    pub cooldown: Duration,
    /// Upper bound on a single gateway call.
    pub timeout: Duration,
    /// Also alert on no-match cycles where no face was in view.
    pub notify_on_empty_frames: bool,
    pub title: String,
    pub body: String,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Enrollment root: one sub-directory of reference photos per identity.
    pub enroll_dir: PathBuf,
    /// Endpoint of the face detection + embedding service.
    pub encoder_url: String,
    pub encoder_timeout: Duration,
    /// Euclidean distance threshold for a candidate reference.
    pub tolerance: f32,
    /// Recognised identities that must be refused.
    pub deny_list: Vec<String>,
    /// Return to `Pending` after this long without a face (`None` = never).
    pub idle_reset: Option<Duration>,
    /// Consecutive transient capture failures tolerated before giving up.
    pub max_capture_failures: u32,
    /// Number of frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Address of the viewer HTTP/WebSocket server.
    pub listen_addr: SocketAddr,
    pub notify: Option<NotifyConfig>,
    /// Path to the SQLite access history database.
    pub db_path: PathBuf,
    pub dbus: BusKind,
}

impl Config {
    /// Load configuration from `GATEKEEPER_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("gatekeeper");

        let db_path = std::env::var("GATEKEEPER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("history.db"));

        let listen_addr = std::env::var("GATEKEEPER_LISTEN")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "invalid GATEKEEPER_LISTEN; using default");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5000)));

        let idle_secs = env_u64("GATEKEEPER_IDLE_RESET_SECS", 0);

        Self {
            camera_device: std::env::var("GATEKEEPER_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            enroll_dir: std::env::var("GATEKEEPER_ENROLL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("faces")),
            encoder_url: std::env::var("GATEKEEPER_ENCODER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8500/encode".to_string()),
            encoder_timeout: Duration::from_secs(env_u64("GATEKEEPER_ENCODER_TIMEOUT_SECS", 5)),
            tolerance: env_f32("GATEKEEPER_TOLERANCE", gatekeeper_core::DEFAULT_TOLERANCE),
            deny_list: std::env::var("GATEKEEPER_DENY_LIST")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            idle_reset: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_capture_failures: env_u64("GATEKEEPER_MAX_CAPTURE_FAILURES", 30) as u32,
            warmup_frames: env_usize("GATEKEEPER_WARMUP_FRAMES", 4),
            listen_addr,
            notify: NotifyConfig::from_env(),
            db_path,
            dbus: match std::env::var("GATEKEEPER_DBUS").as_deref() {
                Ok("session") => BusKind::Session,
                Ok("off") | Ok("0") => BusKind::Off,
                _ => BusKind::System,
            },
        }
    }
}

impl NotifyConfig {
    fn from_env() -> Option<Self> {
        let api_url = env_either("GATEKEEPER_API_URL", "API_URL")?;
        let device_token = env_either("GATEKEEPER_FCM_TOKEN", "FCM_TOKEN")?;
        Some(Self {
            api_url,
            device_token,
            cooldown: Duration::from_secs(env_u64("GATEKEEPER_NOTIFY_COOLDOWN_SECS", 8)),
            timeout: Duration::from_secs(env_u64("GATEKEEPER_NOTIFY_TIMEOUT_SECS", 10)),
            notify_on_empty_frames: env_bool("GATEKEEPER_NOTIFY_EMPTY_FRAMES", false),
            title: std::env::var("GATEKEEPER_NOTIFY_TITLE")
                .unwrap_or_else(|_| "No user Match".to_string()),
            body: std::env::var("GATEKEEPER_NOTIFY_BODY")
                .unwrap_or_else(|_| "unregistered people".to_string()),
        })
    }
}

/// First non-empty value of `primary` or `fallback`.
fn env_either(primary: &str, fallback: &str) -> Option<String> {
    [primary, fallback]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}
