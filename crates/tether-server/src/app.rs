//! Service startup and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tether_config::{Config, ConfigError};
use tether_net::connection::ConnectionOptions;
use tether_net::{
    AcceptAnyKey, Message, MessageRegistry, OnlineServiceHost, PostcardCodec, RegistryConfig,
    RegistryError, SocketConfig,
};

use crate::platform::PlatformError;

/// Errors that stop the service.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Directories could not be resolved or created.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listener could not be started.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Waiting for the shutdown signal failed.
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

/// Registry settings derived from the network section.
pub fn registry_config(config: &Config) -> RegistryConfig {
    let network = &config.network;
    RegistryConfig {
        max_connections: network.max_connections,
        dual_stack: network.dual_stack,
        connection: ConnectionOptions {
            socket: SocketConfig {
                tcp_nodelay: network.tcp_nodelay,
                keepalive_idle: network.keepalive_idle(),
                ..Default::default()
            },
            read_buffer_size: network.read_buffer_size,
        },
    }
}

/// Start listening and serving the online service protocol.
///
/// Must be called from within a tokio runtime.
pub fn start(config: &Config) -> Result<OnlineServiceHost<PostcardCodec<Message>>, AppError> {
    config.validate()?;
    let registry = MessageRegistry::new(Arc::new(PostcardCodec::new()), registry_config(config));
    let authenticator = AcceptAnyKey {
        user_name: config.service.host_user_name.clone(),
    };
    // Subscribe before accepting so no client message goes unanswered.
    let host = OnlineServiceHost::new(registry, Arc::new(authenticator));
    host.registry().start(config.network.listen_port)?;
    tracing::info!(
        "Online service listening on port {} (max {} clients)",
        host.registry().listen_port(),
        config.network.max_connections
    );
    Ok(host)
}

/// Serve until Ctrl-C, then shut down.
pub async fn run(config: &Config) -> Result<(), AppError> {
    let host = start(config)?;
    let signal = tokio::signal::ctrl_c().await;
    tracing::info!(
        "Shutting down with {} connected clients",
        host.registry().number_of_connected_clients()
    );
    host.shutdown();
    // Let writer tasks flush their final frames.
    tokio::time::sleep(Duration::from_millis(100)).await;
    signal.map_err(AppError::Signal)
}
