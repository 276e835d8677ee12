use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use lib_stream::core::GateConfig;
use lib_stream::hub::HubConfig;
use lib_stream::ingestors::TwitterStreamConfig;
use lib_stream::StreamConfig;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Filtered tweet stream hub", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "STREAM_PORT", help = "Port to listen on for subscribers.")]
    pub port: Option<u16>,

    #[clap(long, env = "STREAM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "STREAM_LOG_DIR", help = "Directory for JSON log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "STREAM_LOG_LEVEL", help = "Log filter (trace, debug, info, warn, error or a directive list).")]
    pub log_level: Option<String>,

    #[clap(long, env = "STREAM_UPSTREAM_URL", help = "Filtered stream endpoint.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "STREAM_UPSTREAM_BEARER_TOKEN", hide_env_values = true, help = "Bearer token for the filtered stream endpoint.")]
    pub upstream_bearer_token: Option<String>,

    #[clap(long, env = "STREAM_REPLAY_FILE", help = "Replay a captured stream from this file instead of connecting upstream.")]
    pub replay_file: Option<PathBuf>,

    #[clap(long, env = "STREAM_REPLAY_INTERVAL_MS", help = "Delay between replayed messages.")]
    pub replay_interval_ms: Option<u64>,

    #[clap(long, env = "STREAM_INITIAL_TRACKS", value_delimiter = ',', help = "Comma separated tracks to start with.")]
    pub initial_tracks: Option<Vec<String>>,

    #[clap(long, env = "STREAM_AUTOSTART", help = "Start the stream at boot when tracks are configured.")]
    pub autostart: Option<bool>,

    #[clap(long, env = "STREAM_SCORER_URL", help = "Sentiment scorer endpoint. Without it, flagged tweets are rejected.")]
    pub scorer_url: Option<String>,

    #[clap(long, env = "STREAM_SCORER_THRESHOLD", help = "Minimum score for flagged tweets.")]
    pub scorer_threshold: Option<f32>,

    #[clap(long, env = "STREAM_SCORER_TIMEOUT_MS", help = "Timeout of one scorer call.")]
    pub scorer_timeout_ms: Option<u64>,

    #[clap(long, env = "STREAM_OEMBED_URL", help = "oEmbed endpoint used to render tweets.")]
    pub oembed_url: Option<String>,

    #[clap(long, env = "STREAM_HANDSHAKE_TIMEOUT_MS", help = "Timeout for opening the upstream connection.")]
    pub handshake_timeout_ms: Option<u64>,

    #[clap(long, env = "STREAM_POLL_TIMEOUT_SECS", help = "How long a long polling request waits for frames.")]
    pub poll_timeout_secs: Option<u64>,

    #[clap(long, env = "STREAM_POLL_LINGER_SECS", help = "How long an idle long polling session is kept.")]
    pub poll_linger_secs: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    fn defaults() -> Config {
        let gate = GateConfig::default();
        let stream = StreamConfig::default();
        let hub = HubConfig::default();
        Config {
            port: Some(5000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            upstream_url: Some(TwitterStreamConfig::default().url),
            replay_interval_ms: Some(500),
            autostart: Some(true),
            scorer_threshold: Some(gate.threshold),
            scorer_timeout_ms: Some(gate.timeout_ms),
            oembed_url: Some("https://publish.twitter.com/oembed".to_string()),
            handshake_timeout_ms: Some(stream.handshake_timeout_ms),
            poll_timeout_secs: Some(hub.poll_timeout_secs),
            poll_linger_secs: Some(hub.poll_linger_secs),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            upstream_url: other.upstream_url.or(self.upstream_url),
            upstream_bearer_token: other.upstream_bearer_token.or(self.upstream_bearer_token),
            replay_file: other.replay_file.or(self.replay_file),
            replay_interval_ms: other.replay_interval_ms.or(self.replay_interval_ms),
            initial_tracks: other.initial_tracks.or(self.initial_tracks),
            autostart: other.autostart.or(self.autostart),
            scorer_url: other.scorer_url.or(self.scorer_url),
            scorer_threshold: other.scorer_threshold.or(self.scorer_threshold),
            scorer_timeout_ms: other.scorer_timeout_ms.or(self.scorer_timeout_ms),
            oembed_url: other.oembed_url.or(self.oembed_url),
            handshake_timeout_ms: other.handshake_timeout_ms.or(self.handshake_timeout_ms),
            poll_timeout_secs: other.poll_timeout_secs.or(self.poll_timeout_secs),
            poll_linger_secs: other.poll_linger_secs.or(self.poll_linger_secs),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        let defaults = GateConfig::default();
        GateConfig {
            threshold: self.scorer_threshold.unwrap_or(defaults.threshold),
            timeout_ms: self.scorer_timeout_ms.unwrap_or(defaults.timeout_ms),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            handshake_timeout_ms: self
                .handshake_timeout_ms
                .unwrap_or_else(|| StreamConfig::default().handshake_timeout_ms),
            initial_tracks: self.initial_tracks.clone().unwrap_or_default(),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        let defaults = HubConfig::default();
        HubConfig {
            poll_timeout_secs: self.poll_timeout_secs.unwrap_or(defaults.poll_timeout_secs),
            poll_linger_secs: self.poll_linger_secs.unwrap_or(defaults.poll_linger_secs),
        }
    }

    pub fn twitter_config(&self) -> TwitterStreamConfig {
        let defaults = TwitterStreamConfig::default();
        TwitterStreamConfig {
            url: self.upstream_url.clone().unwrap_or(defaults.url),
            bearer_token: self.upstream_bearer_token.clone(),
            ..defaults
        }
    }

    /// Both PEM files, when both exist on disk.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

fn read_config_file(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Defaults, then the config file (`server_stream.conf` unless overridden),
/// then environment variables and CLI arguments.
pub fn load_config() -> Config {
    resolve(Config::parse())
}

fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_stream.conf"));

    let mut current_config = Config::defaults();

    // Logging is not up yet, problems go to stderr.
    match read_config_file(&config_file_path) {
        Ok(Some(file_config)) => current_config = current_config.merge(file_config),
        Ok(None) => {}
        Err(e) => eprintln!(
            "Failed to load config file {}: {}. Falling back to other sources.",
            config_file_path.display(),
            e
        ),
    }

    current_config = current_config.merge(cli);

    // Apply default TLS paths if not already set
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        }
    }

    current_config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_stream.conf");
        fs::write(
            &path,
            r#"{"port": 7000, "initialTracks": ["rust", "tokio"], "scorerThreshold": 70.0}"#,
        )
        .unwrap();

        let cli = Config::parse_from([
            "server_stream",
            "--config-path",
            path.to_str().unwrap(),
            "--port",
            "7100",
        ]);
        let config = resolve(cli);

        assert_eq!(config.port, Some(7100));
        assert_eq!(config.initial_tracks, Some(vec!["rust".to_string(), "tokio".to_string()]));
        assert_eq!(config.gate_config().threshold, 70.0);
        assert_eq!(config.gate_config().timeout_ms, 2000);
        assert_eq!(config.autostart, Some(true));
    }

    #[test]
    fn tracks_parse_as_a_comma_list() {
        let cli = Config::parse_from(["server_stream", "--initial-tracks", "a,b c", "--autostart", "false"]);
        assert_eq!(cli.initial_tracks, Some(vec!["a".to_string(), "b c".to_string()]));
        assert_eq!(cli.autostart, Some(false));
    }

    #[test]
    fn broken_config_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "{ not json").unwrap();

        let cli = Config::parse_from(["server_stream", "--config-path", path.to_str().unwrap()]);
        let config = resolve(cli);
        assert_eq!(config.port, Some(5000));
    }

    #[test]
    fn tls_requires_both_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("fullchain.pem");
        fs::write(&cert, "cert").unwrap();

        let mut config = Config {
            tls_cert_path: Some(cert.clone()),
            tls_key_path: Some(dir.path().join("privkey.pem")),
            ..Config::default()
        };
        assert!(config.tls_paths().is_none());

        fs::write(dir.path().join("privkey.pem"), "key").unwrap();
        config.tls_key_path = Some(dir.path().join("privkey.pem"));
        assert!(config.tls_paths().is_some());
    }
}
