//! lvexport daemon entry point.
//!
//! Builds the shared domain objects (volume and export managers), wires the
//! three CSI services on a single gRPC endpoint, and serves until
//! interrupted. The endpoint can be a TCP address or a unix socket
//! (`unix:///run/lvexport.sock`), the form CSI sidecars usually expect.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lvexport::command::SystemCommandRunner;
use lvexport::csi::access::AccessLogLayer;
use lvexport::csi::controller::ControllerService;
use lvexport::csi::identity::IdentityService;
use lvexport::csi::node::NodeService;
use lvexport::csi::v1::controller_server::ControllerServer;
use lvexport::csi::v1::identity_server::IdentityServer;
use lvexport::csi::v1::node_server::NodeServer;
use lvexport::initiator::Initiator;
use lvexport::{Config, Error, Lvm, Result, Tgtd};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LVM volume provisioning and iSCSI export daemon with a CSI front-end
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// gRPC endpoint: `host:port` or `unix:///path/to.sock`
    #[arg(long, env = "LVEXPORT_ENDPOINT", default_value = "0.0.0.0:18080")]
    endpoint: String,

    /// LVM volume group backing all managed volumes
    #[arg(long, env = "LVEXPORT_VG", default_value = "vg0")]
    vg: String,

    /// Interfaces whose addresses are advertised to initiators
    #[arg(
        long = "nic",
        env = "LVEXPORT_NICS",
        value_delimiter = ',',
        default_value = "eth0"
    )]
    nics: Vec<String>,

    /// Privilege escalation prefix ("sudo", "doas", "su", or "none")
    #[arg(long, env = "LVEXPORT_BECOME_METHOD", default_value = "sudo")]
    become_method: String,

    /// tgtadm binary, possibly with leading wrapper words
    #[arg(long, env = "LVEXPORT_TGTADM_BIN", default_value = "tgtadm")]
    tgtadm_bin: String,

    /// Backing store type for new LUNs
    #[arg(long, env = "LVEXPORT_TGT_BSTYPE", default_value = "rdwr")]
    tgt_bstype: String,

    /// Backing store options for new LUNs
    #[arg(long, env = "LVEXPORT_TGT_BSOPTS")]
    tgt_bsopts: Option<String>,

    /// Backing store open flags for new LUNs
    #[arg(long, env = "LVEXPORT_TGT_BSOFLAGS")]
    tgt_bsoflags: Option<String>,

    /// Wrapper prefix for LVM commands (e.g. "lvm")
    #[arg(long, env = "LVEXPORT_LVM_BIN")]
    lvm_bin: Option<String>,

    /// Target name prefix; targets are named `<iqn_base>:<random suffix>`
    #[arg(
        long,
        env = "LVEXPORT_IQN_BASE",
        default_value = "iqn.2026-01.dev.lvexport"
    )]
    iqn_base: String,

    /// Filesystem created on fresh volumes
    #[arg(long, env = "LVEXPORT_DEFAULT_FS", default_value = "ext4")]
    default_fs: String,

    /// External command timeout in seconds
    #[arg(long, env = "LVEXPORT_CMD_TIMEOUT", default_value = "10")]
    cmd_timeout: u64,

    /// Node identifier reported by NodeGetInfo
    #[arg(long, env = "LVEXPORT_NODE_ID", default_value = "localhost")]
    node_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LVEXPORT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LVEXPORT_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            vg: self.vg.clone(),
            nics: self.nics.clone(),
            become_method: self.become_method.clone(),
            tgtadm_bin: self.tgtadm_bin.clone(),
            tgt_bstype: self.tgt_bstype.clone(),
            tgt_bsopts: self.tgt_bsopts.clone(),
            tgt_bsoflags: self.tgt_bsoflags.clone(),
            lvm_bin: self.lvm_bin.clone(),
            iqn_base: self.iqn_base.clone(),
            default_fs: self.default_fs.clone(),
            cmd_timeout: Duration::from_secs(self.cmd_timeout),
            node_id: self.node_id.clone(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting lvexport daemon");
    info!("  Endpoint: {}", args.endpoint);
    info!("  Volume group: {}", args.vg);
    info!("  NICs: {:?}", args.nics);
    info!("  Default filesystem: {}", args.default_fs);
    info!("  Node id: {}", args.node_id);

    let config = Arc::new(args.to_config());
    let runner = Arc::new(SystemCommandRunner::new(
        &config.become_method,
        config.cmd_timeout,
    ));
    let lvm = Arc::new(Lvm::new(&config, runner.clone()));
    let tgtd = Arc::new(Tgtd::new(&config, runner.clone()));
    let initiator = Arc::new(Initiator::new(runner));

    if tgtd.system_ready().await.unwrap_or(false) {
        info!("target daemon is ready");
    } else {
        info!("target daemon not ready yet, Probe will report it");
    }

    let identity = IdentityServer::new(IdentityService::new(tgtd.clone()));
    let controller = ControllerServer::new(ControllerService::new(
        lvm.clone(),
        tgtd.clone(),
        &config.default_fs,
    ));
    let node = NodeServer::new(NodeService::new(
        lvm,
        tgtd,
        initiator,
        &config.node_id,
        &config.default_fs,
    ));

    let server = Server::builder()
        .layer(AccessLogLayer)
        .add_service(identity)
        .add_service(controller)
        .add_service(node);

    if let Some(path) = args.endpoint.strip_prefix("unix://") {
        if tokio::fs::metadata(path).await.is_ok() {
            tokio::fs::remove_file(path).await?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("Listening on unix socket {path}");
        server
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown())
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;
    } else {
        let addr = args
            .endpoint
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("bad endpoint: {e}")))?;
        info!("Listening on {addr}");
        server
            .serve_with_shutdown(addr, shutdown())
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;
    }

    info!("Daemon shutdown complete");
    Ok(())
}

async fn shutdown() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, shutting down");
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("h2=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
