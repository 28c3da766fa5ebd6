use crate::ambient::AmbientSettings;
use crate::runner::RunnerSettings;
use crate::speedtest::DEFAULT_SERVERS_URL;
use clap::Args;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings. Every field can come from a flag or its environment variable.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Device identifier written to every row
    #[arg(long, env = "NETLOGGER_DEVICE_ID", default_value = "NET-PI-xx")]
    pub device_id: String,

    /// Seconds between cycles
    #[arg(long, env = "NETLOGGER_INTERVAL_SECONDS", default_value_t = 600)]
    pub interval_seconds: u64,

    /// Random +/- spread applied to the interval
    #[arg(long, env = "NETLOGGER_INTERVAL_JITTER_SECONDS", default_value_t = 30)]
    pub interval_jitter_seconds: u64,

    #[arg(long, env = "NETLOGGER_PING_HOST", default_value = "8.8.8.8")]
    pub ping_host: String,

    #[arg(long, env = "NETLOGGER_PING_COUNT", default_value_t = 5)]
    pub ping_count: u32,

    /// Directory for the daily CSV/TXT logs
    #[arg(long, env = "NETLOGGER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Discovered server pool
    #[arg(long, env = "NETLOGGER_SERVER_CACHE")]
    pub server_cache: Option<PathBuf>,

    /// Last server that succeeded, per provider
    #[arg(long, env = "NETLOGGER_LAST_GOOD_FILE")]
    pub last_good_file: Option<PathBuf>,

    /// Parallel transfers per speed test (default: min(4, CPUs))
    #[arg(long, env = "NETLOGGER_THREADS", value_parser = clap::value_parser!(u64).range(1..))]
    pub threads: Option<u64>,

    /// Attempts per server before moving on
    #[arg(long, env = "NETLOGGER_RETRIES", default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    #[arg(long, env = "NETLOGGER_RETRY_BACKOFF_SECONDS", default_value_t = 5)]
    pub retry_backoff_seconds: u64,

    #[arg(long, env = "NETLOGGER_REDISCOVERY_PAUSE_SECONDS", default_value_t = 3)]
    pub rediscovery_pause_seconds: u64,

    /// Pause after a successful provider test, before the next provider
    #[arg(long, env = "NETLOGGER_PROVIDER_PAUSE_SECONDS", default_value_t = 5)]
    pub provider_pause_seconds: u64,

    /// Per-request timeout inside a speed test
    #[arg(long, env = "NETLOGGER_SESSION_TIMEOUT_SECONDS", default_value_t = 180)]
    pub session_timeout_seconds: u64,

    #[arg(long, env = "NETLOGGER_SERVER_LIST_URL", default_value = DEFAULT_SERVERS_URL)]
    pub server_list_url: String,

    #[arg(long, env = "NETLOGGER_HTTP_PROBE_URL", default_value = "https://www.bbc.com/")]
    pub http_probe_url: String,

    #[arg(long, env = "NETLOGGER_GEO_URL", default_value = "https://ipinfo.io/json")]
    pub geo_url: String,

    #[arg(long, env = "SUPABASE_URL", hide_env_values = true)]
    pub supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    pub supabase_anon_key: Option<String>,

    #[arg(long, env = "SUPABASE_TABLE", default_value = "netlogs")]
    pub supabase_table: String,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "netlogger")
}

impl Config {
    pub fn log_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.log_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from(".").join("logs"))
    }

    pub fn server_cache_path(&self) -> PathBuf {
        self.server_cache
            .clone()
            .unwrap_or_else(|| cache_dir().join("uae_servers_cache.json"))
    }

    pub fn last_good_path(&self) -> PathBuf {
        self.last_good_file
            .clone()
            .unwrap_or_else(|| cache_dir().join("last_good_server.json"))
    }

    pub fn concurrency(&self) -> usize {
        match self.threads {
            Some(n) => n as usize,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(4),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            concurrency: self.concurrency(),
            retry_backoff: Duration::from_secs(self.retry_backoff_seconds),
            rediscovery_pause: Duration::from_secs(self.rediscovery_pause_seconds),
        }
    }

    pub fn ambient_settings(&self) -> AmbientSettings {
        AmbientSettings {
            geo_url: self.geo_url.clone(),
            http_probe_url: self.http_probe_url.clone(),
            ping_host: self.ping_host.clone(),
            ping_count: self.ping_count,
        }
    }
}

fn cache_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(std::env::temp_dir)
}
