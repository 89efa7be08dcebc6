//! Client composition: a [`ContentStore`] kept in sync over an online
//! service connection, both built from the application config.

use std::sync::Arc;
use std::time::Duration;

use tether_config::{Config, NetworkConfig};
use tether_net::connection::{ConnectionId, ConnectionOptions};
use tether_net::messages::LoginRequest;
use tether_net::{
    Message, MessageConnection, OnlineServiceConnection, PostcardCodec, ReadyTimeouts,
    ServiceError, ServiceHandler, SocketConfig,
};

use crate::error::ContentError;
use crate::store::ContentStore;

/// Errors raised while bringing up a content client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The content directory could not be opened.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Connecting, logging in, or waiting for content failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Content store plus the service connection feeding it.
pub struct ContentClient {
    store: Arc<ContentStore>,
    service: OnlineServiceConnection<PostcardCodec<Message>>,
    address: String,
    port: u16,
    timeouts: ReadyTimeouts,
}

impl ContentClient {
    /// Open the configured content directory and prepare the connection.
    /// Nothing is sent before [`ContentClient::start`].
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let store = Arc::new(ContentStore::open(
            &config.content.directory,
            &config.content.metadata_file,
            &config.service.project_name,
        )?);
        let connection = MessageConnection::with_options(
            Arc::new(PostcardCodec::new()),
            ConnectionId::CLIENT,
            connection_options(&config.network),
        );
        let service = OnlineServiceConnection::new(
            connection,
            LoginRequest {
                api_key: config.service.api_key.clone(),
                project_name: config.service.project_name.clone(),
            },
            Arc::clone(&store) as Arc<dyn ServiceHandler>,
        );

        Ok(Self {
            store,
            service,
            address: config.network.service_address.clone(),
            port: config.network.service_port,
            timeouts: ReadyTimeouts {
                cached: config.service.ready_timeout_cached(),
                uncached: config.service.ready_timeout_uncached(),
            },
        })
    }

    /// How long [`ContentClient::start`] waits, depending on whether content
    /// is cached locally.
    pub fn ready_timeout(&self) -> Duration {
        self.timeouts.for_cache(self.store.has_cached_content())
    }

    /// Connect, log in, and wait until the service reports content ready.
    ///
    /// On failure the connection is closed.
    pub async fn start(&self) -> Result<(), ClientError> {
        let timeout = self.ready_timeout();
        tracing::info!(
            "Connecting to online service {}:{} (ready timeout {timeout:?})",
            self.address,
            self.port
        );
        let result = async {
            self.service.connect(&self.address, self.port).await?;
            self.service.wait_until_ready(timeout).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Online service unavailable: {e}");
            self.service.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// The synchronized content.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// The underlying service connection.
    pub fn service(&self) -> &OnlineServiceConnection<PostcardCodec<Message>> {
        &self.service
    }

    /// Close the service connection. The store stays usable.
    pub fn disconnect(&self) {
        self.service.disconnect();
    }
}

/// Build a client from `config` and start it.
pub async fn connect(config: &Config) -> Result<ContentClient, ClientError> {
    let client = ContentClient::new(config)?;
    client.start().await?;
    Ok(client)
}

fn connection_options(network: &NetworkConfig) -> ConnectionOptions {
    ConnectionOptions {
        socket: SocketConfig {
            tcp_nodelay: network.tcp_nodelay,
            keepalive_idle: network.keepalive_idle(),
            ..Default::default()
        },
        read_buffer_size: network.read_buffer_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use tether_net::messages::ContentType;
    use tether_net::{AcceptAnyKey, MessageRegistry, OnlineServiceHost, RegistryConfig};
    use tokio::net::TcpListener;

    use crate::index::ContentIndex;

    async fn start_host() -> (OnlineServiceHost<PostcardCodec<Message>>, u16) {
        let registry =
            MessageRegistry::new(Arc::new(PostcardCodec::new()), RegistryConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        registry.start_with_listener(listener).unwrap();
        let host = OnlineServiceHost::new(registry, Arc::new(AcceptAnyKey::default()));
        (host, port)
    }

    fn client_config(root: &Path, port: u16, api_key: &str) -> Config {
        let mut config = Config::default();
        config.network.service_port = port;
        config.service.api_key = api_key.to_string();
        config.service.project_name = "Breakout".to_string();
        config.content.directory = root.join("Content");
        config
    }

    #[test]
    fn test_ready_timeout_follows_cache_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path(), 800, "key");
        config.service.ready_timeout_cached_ms = 1_234;
        config.service.ready_timeout_uncached_ms = 5_678;

        let client = ContentClient::new(&config).unwrap();
        assert_eq!(client.ready_timeout(), Duration::from_millis(5_678));

        let mut index = ContentIndex::new("Breakout");
        index.upsert(tether_net::messages::ContentMetaData::new(
            "DeltaEngineLogo",
            ContentType::Image,
        ));
        index
            .save(&config.content.directory.join(&config.content.metadata_file))
            .unwrap();
        let cached = ContentClient::new(&config).unwrap();
        assert_eq!(cached.ready_timeout(), Duration::from_millis(1_234));
    }

    #[tokio::test]
    async fn test_connect_with_config_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (host, port) = start_host().await;

        let client = connect(&client_config(dir.path(), port, "key"))
            .await
            .unwrap();

        assert!(client.store().is_ready());
        assert!(client.service().is_logged_in());
        assert_eq!(client.service().session().user_name(), Some("TestUser"));
        assert_eq!(
            client.service().connection().target_address(),
            Some(format!("127.0.0.1:{port}"))
        );
        client.disconnect();
        host.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_login_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (host, port) = start_host().await;

        let client = ContentClient::new(&client_config(dir.path(), port, "")).unwrap();
        let result = client.start().await;

        assert!(matches!(
            result,
            Err(ClientError::Service(ServiceError::Server(_)))
        ));
        assert!(client.service().connection().is_closed());
        assert!(!client.store().is_ready());
        host.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_service_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect(&client_config(dir.path(), port, "key")).await;
        assert!(matches!(
            result,
            Err(ClientError::Service(ServiceError::Connection(_)))
        ));
    }
}
