//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, DuetConfig};
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/duetline/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("duetline/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("duetline.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key,
/// every other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Build a config from a merged table, filling gaps with defaults.
///
/// `origin` names the file reported in parse errors.
pub fn config_from_table(table: toml::Table, origin: &Path) -> Result<DuetConfig, ConfigError> {
    let mut config: DuetConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.paths.store_dir = expand_path(&config.paths.store_dir.to_string_lossy());
    config.paths.recordings_dir = expand_path(&config.paths.recordings_dir.to_string_lossy());
    config.paths.segments_file = expand_path(&config.paths.segments_file.to_string_lossy());
    config.calibration.ffmpeg_path = expand_path(&config.calibration.ffmpeg_path.to_string_lossy());

    Ok(config)
}

fn parse_keyword<T: DeserializeOwned>(value: &str) -> Option<T> {
    toml::Value::String(value.trim().to_lowercase()).try_into().ok()
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut DuetConfig, sources: &mut ConfigSources) {
    // Paths
    if let Ok(v) = env::var("DUETLINE_STORE_DIR") {
        config.paths.store_dir = expand_path(&v);
        sources.env_overrides.push("DUETLINE_STORE_DIR".to_string());
    }
    if let Ok(v) = env::var("DUETLINE_RECORDINGS_DIR") {
        config.paths.recordings_dir = expand_path(&v);
        sources.env_overrides.push("DUETLINE_RECORDINGS_DIR".to_string());
    }
    if let Ok(v) = env::var("DUETLINE_SEGMENTS_FILE") {
        config.paths.segments_file = expand_path(&v);
        sources.env_overrides.push("DUETLINE_SEGMENTS_FILE".to_string());
    }

    // Audio
    if let Ok(v) = env::var("DUETLINE_DEVICE") {
        if let Some(device) = parse_keyword(&v) {
            config.audio.device = device;
            sources.env_overrides.push("DUETLINE_DEVICE".to_string());
        }
    }
    if let Ok(v) = env::var("DUETLINE_SAMPLE_RATE") {
        if let Ok(rate) = v.parse() {
            config.audio.sample_rate = rate;
            sources.env_overrides.push("DUETLINE_SAMPLE_RATE".to_string());
        }
    }
    if let Ok(v) = env::var("DUETLINE_BUFFER_FRAMES") {
        if let Ok(frames) = v.parse() {
            config.audio.buffer_frames = frames;
            sources.env_overrides.push("DUETLINE_BUFFER_FRAMES".to_string());
        }
    }
    if let Ok(v) = env::var("DUETLINE_MAX_RECORDING_SECS") {
        if let Ok(secs) = v.parse() {
            config.audio.max_recording_secs = secs;
            sources.env_overrides.push("DUETLINE_MAX_RECORDING_SECS".to_string());
        }
    }
    if let Ok(v) = env::var("DUETLINE_PLAYBACK") {
        if let Some(mode) = parse_keyword(&v) {
            config.audio.playback = mode;
            sources.env_overrides.push("DUETLINE_PLAYBACK".to_string());
        }
    }

    // Monitor
    if let Ok(v) = env::var("DUETLINE_POLL_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.monitor.poll_interval_ms = ms;
            sources.env_overrides.push("DUETLINE_POLL_INTERVAL_MS".to_string());
        }
    }
    if let Ok(v) = env::var("DUETLINE_TRIGGER") {
        if let Some(trigger) = parse_keyword(&v) {
            config.monitor.trigger = trigger;
            sources.env_overrides.push("DUETLINE_TRIGGER".to_string());
        }
    }

    // Calibration
    if let Ok(v) = env::var("DUETLINE_FFMPEG") {
        config.calibration.ffmpeg_path = expand_path(&v);
        sources.env_overrides.push("DUETLINE_FFMPEG".to_string());
    }

    // Telemetry
    if let Ok(v) = env::var("DUETLINE_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("DUETLINE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConverterKind, DeviceKind, PlaybackMode, TriggerMode};

    fn parse(toml: &str) -> DuetConfig {
        let table: toml::Table = toml.parse().unwrap();
        config_from_table(table, Path::new("test.toml")).unwrap()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = parse(
            r#"
[paths]
store_dir = "/custom/store"
"#,
        );
        assert_eq!(config.paths.store_dir, PathBuf::from("/custom/store"));
        assert_eq!(config.audio.buffer_frames, 256);
        assert_eq!(config.monitor.trigger, TriggerMode::Poll);
    }

    #[test]
    fn test_parse_full_toml() {
        let config = parse(
            r#"
[paths]
store_dir = "/data/store"
recordings_dir = "/data/takes"
segments_file = "/data/segments.json"

[audio]
device = "pipewire"
sample_rate = 48000
buffer_frames = 128
max_recording_secs = 30
master_gain = 0.5
playback = "sequential"

[monitor]
poll_interval_ms = 5
trigger = "callback"

[calibration]
threshold_ratio = 0.75
converter = "ffmpeg"
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"

[telemetry]
log_level = "debug"
"#,
        );

        assert_eq!(config.paths.recordings_dir, PathBuf::from("/data/takes"));
        assert_eq!(config.paths.segments_file, PathBuf::from("/data/segments.json"));
        assert_eq!(config.audio.device, DeviceKind::Pipewire);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.buffer_frames, 128);
        assert_eq!(config.audio.max_recording_secs, 30);
        assert_eq!(config.audio.master_gain, 0.5);
        assert_eq!(config.audio.playback, PlaybackMode::Sequential);
        assert_eq!(config.monitor.poll_interval_ms, 5);
        assert_eq!(config.monitor.trigger, TriggerMode::Callback);
        assert_eq!(config.calibration.threshold_ratio, 0.75);
        assert_eq!(config.calibration.converter, ConverterKind::Ffmpeg);
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_unknown_keyword_is_parse_error() {
        let table: toml::Table = "[monitor]\ntrigger = \"sometimes\"\n".parse().unwrap();
        let err = config_from_table(table, Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_merge_tables_nested() {
        let mut base: toml::Table = "[audio]\nsample_rate = 44100\nbuffer_frames = 64\n"
            .parse()
            .unwrap();
        let overlay: toml::Table = "[audio]\nbuffer_frames = 512\n[telemetry]\nlog_level = \"warn\"\n"
            .parse()
            .unwrap();

        merge_tables(&mut base, overlay);

        let audio = base["audio"].as_table().unwrap();
        assert_eq!(audio["sample_rate"].as_integer(), Some(44100));
        assert_eq!(audio["buffer_frames"].as_integer(), Some(512));
        assert_eq!(base["telemetry"]["log_level"].as_str(), Some("warn"));
    }

    #[test]
    fn test_parse_keyword_is_case_insensitive() {
        assert_eq!(parse_keyword::<TriggerMode>("Callback"), Some(TriggerMode::Callback));
        assert_eq!(parse_keyword::<DeviceKind>(" virtual "), Some(DeviceKind::Virtual));
        assert_eq!(parse_keyword::<PlaybackMode>("shuffle"), None);
    }
}
