//! acplink - bidirectional JSON-RPC connections for agent/client protocols
//!
//! This crate re-exports the connection engine from `acplink-core` and adds
//! process-level setup such as logging initialisation.

pub use acplink_core::*;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Output goes to stderr so
/// that stdout stays free for protocol frames when running over stdio.
/// Installing twice is an error.
pub fn init_logging(config: &LoggingConfig) -> RpcResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| RpcError::config(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        other => {
            return Err(RpcError::config(format!("unknown log format '{}'", other)));
        }
    };

    result.map_err(|e| RpcError::config(format!("failed to install logger: {}", e)))
}
