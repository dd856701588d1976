//! Process configuration.
//!
//! All options are read once at startup from flags or `FORTSA_*` environment
//! variables and are immutable afterwards.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// fortsa - keeps mesh sidecars on the control-plane revision their namespace selects
#[derive(Parser, Debug, Clone)]
#[command(name = "fortsa", version, about, long_about = None)]
pub struct Config {
    /// Don't restart workloads, only log what would be done
    #[arg(long, env = "FORTSA_DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    /// Rate-limit restarts to this many per minute, process-wide
    #[arg(long, env = "FORTSA_RESTARTS_PER_MINUTE", default_value_t = 5.0)]
    pub restarts_per_minute: f64,

    /// Permit short bursts of up to this many simultaneous restarts
    #[arg(long, env = "FORTSA_ACTIVE_RESTART_LIMIT", default_value_t = 5)]
    pub active_restart_limit: u32,

    #[command(flatten)]
    pub xds: XdsConfig,
}

/// Options for the control-plane xDS debug-synchronization query
#[derive(clap::Args, Debug, Clone)]
pub struct XdsConfig {
    /// xDS host of the control plane
    #[arg(
        long,
        env = "FORTSA_XDS_ADDRESS",
        default_value = "control-plane.mesh-system.svc"
    )]
    pub xds_address: String,

    /// xDS port (typically 15010 plaintext, 15012 TLS)
    #[arg(long, env = "FORTSA_XDS_PORT", default_value_t = 15012)]
    pub xds_port: u16,

    /// How long to wait before giving up on an xDS query, in seconds
    #[arg(long, env = "FORTSA_XDS_TIMEOUT_SECS", default_value_t = 30)]
    pub xds_timeout_secs: u64,

    /// Talk plain text to the xDS port and skip bearer-token credentials
    #[arg(long, env = "FORTSA_XDS_PLAINTEXT", default_value_t = false)]
    pub xds_plaintext: bool,

    /// Local directory containing the CA certificate (`root-cert.pem`) for the
    /// xDS endpoint; native roots are used when unset
    #[arg(long, env = "FORTSA_XDS_CERT_DIR")]
    pub xds_cert_dir: Option<PathBuf>,

    /// Audience for the service-account tokens presented to the control plane
    #[arg(long, env = "FORTSA_XDS_TOKEN_AUDIENCE", default_value = "mesh-ca")]
    pub xds_token_audience: String,

    /// Service account whose tokens authenticate the xDS query
    #[arg(long, env = "FORTSA_XDS_SERVICE_ACCOUNT", default_value = "default")]
    pub xds_service_account: String,
}

impl XdsConfig {
    /// Query timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.xds_timeout_secs)
    }

    /// Full endpoint URI for the xDS channel
    pub fn endpoint_uri(&self) -> String {
        let scheme = if self.xds_plaintext { "http" } else { "https" };
        format!("{}://{}:{}", scheme, self.xds_address, self.xds_port)
    }
}
