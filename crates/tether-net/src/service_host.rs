//! Server side of the online content service protocol.
//!
//! [`OnlineServiceHost`] listens to a [`ConnectionRegistry`] and answers
//! every client: logins are checked by an [`Authenticator`] and followed by
//! `ContentReady`, log lines are accepted from logged-in clients only, and
//! every other message is answered with `UnknownMessage`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::codec::MessageCodec;
use crate::connection::ConnectionId;
use crate::events::{SubscriptionId, lock};
use crate::messages::{LoginRequest, LoginSuccessful, Message, ServerError, UnknownMessage};
use crate::registry::{ConnectionRegistry, RegistryEvent};

/// Reply to a login without an API key.
pub const MISSING_API_KEY: &str = "Unable to login without ApiKey";

/// Reply to a message that needs a login.
pub const LOGIN_REQUIRED: &str = "Unable to process message without login";

/// Decides who owns an API key.
pub trait Authenticator: Send + Sync + 'static {
    /// Return the user name for a valid login, or the error sent back.
    /// Empty keys are rejected before this is called.
    fn authenticate(&self, request: &LoginRequest) -> Result<String, String>;
}

/// Accepts every non-empty key as one fixed user. For development setups.
#[derive(Debug, Clone)]
pub struct AcceptAnyKey {
    /// Name reported for every login.
    pub user_name: String,
}

impl Default for AcceptAnyKey {
    fn default() -> Self {
        Self {
            user_name: "TestUser".to_string(),
        }
    }
}

impl Authenticator for AcceptAnyKey {
    fn authenticate(&self, _request: &LoginRequest) -> Result<String, String> {
        Ok(self.user_name.clone())
    }
}

#[derive(Debug, Clone)]
struct ClientSession {
    user_name: String,
    project_name: String,
}

/// Protocol logic shared by all clients of one host.
struct HostState {
    authenticator: Arc<dyn Authenticator>,
    sessions: Mutex<HashMap<ConnectionId, ClientSession>>,
}

impl HostState {
    /// Replies for one incoming message, in sending order.
    fn respond(&self, id: ConnectionId, message: &Message) -> Vec<Message> {
        match message {
            Message::LoginRequest(request) => self.login(id, request),
            Message::LogInfo(info) => match lock(&self.sessions).get(&id) {
                Some(session) => {
                    tracing::info!(
                        "[{}/{}] {}",
                        session.user_name,
                        session.project_name,
                        info.text
                    );
                    Vec::new()
                }
                None => vec![server_error(LOGIN_REQUIRED)],
            },
            Message::LoginSuccessful(_)
            | Message::ServerError(_)
            | Message::UnknownMessage(_)
            | Message::ContentReady
            | Message::SetProject(_)
            | Message::CheckProjectContent(_)
            | Message::UpdateContent(_)
            | Message::DeleteContent(_)
            | Message::TextMessage(_) => vec![Message::UnknownMessage(UnknownMessage {
                text: format!("{} is not supported", message.type_name()),
            })],
        }
    }

    fn login(&self, id: ConnectionId, request: &LoginRequest) -> Vec<Message> {
        if request.api_key.is_empty() {
            tracing::warn!("Connection {id} tried to log in without an API key");
            return vec![server_error(MISSING_API_KEY)];
        }
        match self.authenticator.authenticate(request) {
            Ok(user_name) => {
                tracing::info!(
                    "Connection {id} logged in as {user_name} for {}",
                    request.project_name
                );
                lock(&self.sessions).insert(
                    id,
                    ClientSession {
                        user_name: user_name.clone(),
                        project_name: request.project_name.clone(),
                    },
                );
                vec![
                    Message::LoginSuccessful(LoginSuccessful { user_name }),
                    Message::ContentReady,
                ]
            }
            Err(error) => {
                tracing::warn!("Connection {id} login rejected: {error}");
                vec![server_error(&error)]
            }
        }
    }
}

fn server_error(error: &str) -> Message {
    Message::ServerError(ServerError {
        error: error.to_string(),
    })
}

/// Online service running on top of a registry.
pub struct OnlineServiceHost<C: MessageCodec<Message = Message>> {
    registry: ConnectionRegistry<C>,
    state: Arc<HostState>,
    subscription: SubscriptionId,
}

impl<C: MessageCodec<Message = Message>> OnlineServiceHost<C> {
    /// Serve every client of `registry`. The registry may already be running.
    pub fn new(registry: ConnectionRegistry<C>, authenticator: Arc<dyn Authenticator>) -> Self {
        let state = Arc::new(HostState {
            authenticator,
            sessions: Mutex::new(HashMap::new()),
        });

        let handler_state = Arc::clone(&state);
        let subscription = registry.subscribe(move |event| match event {
            RegistryEvent::ClientConnected(connection) => {
                tracing::debug!("Service client {} connected", connection.id());
            }
            RegistryEvent::ClientDataReceived(connection, message) => {
                for reply in handler_state.respond(connection.id(), message) {
                    if let Err(e) = connection.send(&reply) {
                        tracing::warn!("Reply to {} not sent: {e}", connection.id());
                    }
                }
            }
            RegistryEvent::ClientDisconnected(connection) => {
                if let Some(session) = lock(&handler_state.sessions).remove(&connection.id()) {
                    tracing::info!("{} logged out", session.user_name);
                }
            }
        });

        Self {
            registry,
            state,
            subscription,
        }
    }

    /// The registry this host serves.
    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    /// Number of clients with an accepted login.
    pub fn logged_in_clients(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// User logged in on a connection.
    pub fn user_name(&self, id: ConnectionId) -> Option<String> {
        lock(&self.state.sessions)
            .get(&id)
            .map(|session| session.user_name.clone())
    }

    /// Stop serving and shut the registry down.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.registry.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{LogInfo, TextMessage};

    struct RejectAll;

    impl Authenticator for RejectAll {
        fn authenticate(&self, _request: &LoginRequest) -> Result<String, String> {
            Err("Invalid ApiKey".to_string())
        }
    }

    fn state(authenticator: Arc<dyn Authenticator>) -> HostState {
        HostState {
            authenticator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn login(api_key: &str) -> Message {
        Message::LoginRequest(LoginRequest {
            api_key: api_key.to_string(),
            project_name: "Breakout".to_string(),
        })
    }

    fn log_info() -> Message {
        Message::LogInfo(LogInfo {
            text: "Hello".to_string(),
        })
    }

    #[test]
    fn test_empty_api_key_is_rejected() {
        let host = state(Arc::new(AcceptAnyKey::default()));
        let replies = host.respond(ConnectionId(1), &login(""));
        assert_eq!(replies, vec![server_error(MISSING_API_KEY)]);
        assert!(lock(&host.sessions).is_empty());
    }

    #[test]
    fn test_login_replies_success_then_content_ready() {
        let host = state(Arc::new(AcceptAnyKey::default()));
        let replies = host.respond(ConnectionId(1), &login("key"));
        assert_eq!(
            replies,
            vec![
                Message::LoginSuccessful(LoginSuccessful {
                    user_name: "TestUser".to_string()
                }),
                Message::ContentReady,
            ]
        );
    }

    #[test]
    fn test_authenticator_rejection_is_reported() {
        let host = state(Arc::new(RejectAll));
        let replies = host.respond(ConnectionId(1), &login("key"));
        assert_eq!(replies, vec![server_error("Invalid ApiKey")]);
    }

    #[test]
    fn test_log_info_requires_login() {
        let host = state(Arc::new(AcceptAnyKey::default()));
        assert_eq!(
            host.respond(ConnectionId(1), &log_info()),
            vec![server_error(LOGIN_REQUIRED)]
        );

        host.respond(ConnectionId(1), &login("key"));
        assert!(host.respond(ConnectionId(1), &log_info()).is_empty());
        assert_eq!(
            host.respond(ConnectionId(2), &log_info()),
            vec![server_error(LOGIN_REQUIRED)],
            "Logins are per connection"
        );
    }

    #[test]
    fn test_other_messages_are_not_supported() {
        let host = state(Arc::new(AcceptAnyKey::default()));
        let replies = host.respond(ConnectionId(1), &Message::TextMessage(TextMessage::from("Hi")));
        assert_eq!(
            replies,
            vec![Message::UnknownMessage(UnknownMessage {
                text: "TextMessage is not supported".to_string()
            })]
        );
    }
}
