//! Configuration for a PowerShell session.
//!
//! Configuration is resolved with the following priority (highest to lowest):
//! 1. Explicit values set on the `Config` after construction
//! 2. Environment variables (`PWSH_BRIDGE_*`, one per field)
//! 3. Configuration file (JSON)
//! 4. Default values
//!
//! A `Config` is immutable once a session has been opened with it; the
//! session keeps its own copy.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the PowerShell executable.
    pub executable: PathBuf,
    /// Startup arguments. The defaults request a non-interactive,
    /// profile-free interpreter.
    pub args: Vec<String>,
    /// Text encoding used to decode interpreter output.
    pub encoding: TextEncoding,
    /// Per-phase timeouts.
    pub timeouts: TimeoutSection,
    /// Startup retry behavior.
    pub retry: RetrySection,
    /// Substitute an in-process canned responder for the real subprocess.
    pub mock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(default_executable()),
            args: vec![
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
            ],
            encoding: TextEncoding::Utf8,
            timeouts: TimeoutSection::default(),
            retry: RetrySection::default(),
            mock: false,
        }
    }
}

/// Default PowerShell 7 executable name for the current platform.
fn default_executable() -> &'static str {
    #[cfg(windows)]
    {
        "pwsh.exe"
    }
    #[cfg(not(windows))]
    {
        "pwsh"
    }
}

/// Per-phase timeout configuration, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// Process spawn plus readiness probe.
    pub startup_ms: u64,
    /// Default per-command timeout, measured from submission.
    pub command_ms: u64,
    /// Graceful shutdown window before the process is killed.
    pub shutdown_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            startup_ms: 30_000,
            command_ms: 30_000,
            shutdown_ms: 10_000,
        }
    }
}

impl TimeoutSection {
    /// Startup timeout as a `Duration`.
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Default per-command timeout as a `Duration`.
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    /// Shutdown grace period as a `Duration`.
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

/// Startup retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Maximum total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Additive random jitter, as a fraction of the current delay (0.0..=1.0).
    pub jitter_fraction: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_fraction: 0.1,
        }
    }
}

impl RetrySection {
    /// Base delay as a `Duration`.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a `Duration`.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Text encoding for interpreter output.
///
/// `Utf8` treats invalid byte sequences as a communication error; `Utf8Lossy`
/// replaces them with U+FFFD and keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// Strict UTF-8.
    #[default]
    Utf8,
    /// UTF-8 with replacement characters for invalid sequences.
    Utf8Lossy,
}

impl TextEncoding {
    /// Decode a byte buffer according to this encoding.
    pub fn decode(self, bytes: Vec<u8>) -> Result<String, std::string::FromUtf8Error> {
        match self {
            TextEncoding::Utf8 => String::from_utf8(bytes),
            TextEncoding::Utf8Lossy => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TextEncoding::Utf8),
            "utf8-lossy" | "utf-8-lossy" => Ok(TextEncoding::Utf8Lossy),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown encoding: {other}"
            ))),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Apply environment variable overrides.
    ///
    /// Each configuration field has a one-to-one `PWSH_BRIDGE_*` mirror.
    /// Unparseable values are ignored, leaving the current value in place.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("PWSH_BRIDGE_EXECUTABLE") {
            if !path.is_empty() {
                self.executable = PathBuf::from(path);
            }
        }

        if let Ok(args) = std::env::var("PWSH_BRIDGE_ARGS") {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(enc) = std::env::var("PWSH_BRIDGE_ENCODING") {
            if let Ok(enc) = enc.parse() {
                self.encoding = enc;
            }
        }

        apply_env_u64("PWSH_BRIDGE_STARTUP_TIMEOUT_MS", &mut self.timeouts.startup_ms);
        apply_env_u64("PWSH_BRIDGE_COMMAND_TIMEOUT_MS", &mut self.timeouts.command_ms);
        apply_env_u64(
            "PWSH_BRIDGE_SHUTDOWN_TIMEOUT_MS",
            &mut self.timeouts.shutdown_ms,
        );

        if let Ok(attempts) = std::env::var("PWSH_BRIDGE_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.retry.max_attempts = attempts;
            }
        }
        apply_env_u64("PWSH_BRIDGE_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
        apply_env_u64("PWSH_BRIDGE_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms);

        if let Ok(jitter) = std::env::var("PWSH_BRIDGE_RETRY_JITTER") {
            if let Ok(jitter) = jitter.parse() {
                self.retry.jitter_fraction = jitter;
            }
        }

        if let Ok(mock) = std::env::var("PWSH_BRIDGE_MOCK") {
            self.mock = matches!(mock.as_str(), "1" | "true" | "yes");
        }
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executable.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("executable path is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::InvalidValue(format!(
                "retry.jitter_fraction must be within 0.0..=1.0, got {}",
                self.retry.jitter_fraction
            )));
        }
        if self.timeouts.command_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timeouts.command_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn apply_env_u64(key: &str, slot: &mut u64) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(value) = value.parse() {
            *slot = value;
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// A field value is out of range or unparseable.
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidValue(msg) => write!(f, "invalid config value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn clear_env() {
        for key in [
            "PWSH_BRIDGE_EXECUTABLE",
            "PWSH_BRIDGE_ARGS",
            "PWSH_BRIDGE_ENCODING",
            "PWSH_BRIDGE_STARTUP_TIMEOUT_MS",
            "PWSH_BRIDGE_COMMAND_TIMEOUT_MS",
            "PWSH_BRIDGE_SHUTDOWN_TIMEOUT_MS",
            "PWSH_BRIDGE_RETRY_MAX_ATTEMPTS",
            "PWSH_BRIDGE_RETRY_BASE_DELAY_MS",
            "PWSH_BRIDGE_RETRY_MAX_DELAY_MS",
            "PWSH_BRIDGE_RETRY_JITTER",
            "PWSH_BRIDGE_MOCK",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.executable.to_string_lossy().starts_with("pwsh"));
        assert!(config.args.contains(&"-NonInteractive".to_string()));
        assert_eq!(config.encoding, TextEncoding::Utf8);
        assert_eq!(config.timeouts.command(), Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.mock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "executable": "/opt/microsoft/powershell/7/pwsh",
            "timeouts": {
                "command_ms": 5000
            },
            "retry": {
                "max_attempts": 5
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.executable,
            PathBuf::from("/opt/microsoft/powershell/7/pwsh")
        );
        assert_eq!(config.timeouts.command_ms, 5000);
        // Unspecified fields keep their defaults.
        assert_eq!(config.timeouts.shutdown_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    #[serial]
    fn test_apply_env_overrides() {
        clear_env();
        std::env::set_var("PWSH_BRIDGE_EXECUTABLE", "/usr/bin/pwsh-preview");
        std::env::set_var("PWSH_BRIDGE_ARGS", "-NoLogo -NoProfile");
        std::env::set_var("PWSH_BRIDGE_COMMAND_TIMEOUT_MS", "1234");
        std::env::set_var("PWSH_BRIDGE_RETRY_MAX_ATTEMPTS", "7");
        std::env::set_var("PWSH_BRIDGE_RETRY_JITTER", "0.25");
        std::env::set_var("PWSH_BRIDGE_MOCK", "true");

        let config = Config::from_env();
        assert_eq!(config.executable, PathBuf::from("/usr/bin/pwsh-preview"));
        assert_eq!(config.args, vec!["-NoLogo", "-NoProfile"]);
        assert_eq!(config.timeouts.command_ms, 1234);
        assert_eq!(config.retry.max_attempts, 7);
        assert!((config.retry.jitter_fraction - 0.25).abs() < f64::EPSILON);
        assert!(config.mock);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_lower_precedence_than_explicit() {
        clear_env();
        std::env::set_var("PWSH_BRIDGE_COMMAND_TIMEOUT_MS", "1111");

        let mut config = Config::from_env();
        assert_eq!(config.timeouts.command_ms, 1111);

        // Explicit values set after loading win.
        config.timeouts.command_ms = 2222;
        assert_eq!(config.timeouts.command_ms, 2222);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_unparseable_value_ignored() {
        clear_env();
        std::env::set_var("PWSH_BRIDGE_COMMAND_TIMEOUT_MS", "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.timeouts.command_ms, 30_000);

        clear_env();
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!("utf8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!(
            "utf-8-lossy".parse::<TextEncoding>().unwrap(),
            TextEncoding::Utf8Lossy
        );
        assert!("latin1".parse::<TextEncoding>().is_err());
    }

    #[test]
    fn test_encoding_decode() {
        let valid = b"hello".to_vec();
        assert_eq!(TextEncoding::Utf8.decode(valid).unwrap(), "hello");

        let invalid = vec![0xff, 0xfe, b'h', b'i'];
        assert!(TextEncoding::Utf8.decode(invalid.clone()).is_err());
        assert!(TextEncoding::Utf8Lossy
            .decode(invalid)
            .unwrap()
            .contains("hi"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.jitter_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executable = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeouts.command_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"executable\""));
        assert!(json.contains("\"timeouts\""));
        assert!(json.contains("\"retry\""));
    }
}
