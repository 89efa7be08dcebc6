//! Client side of the online content service protocol.
//!
//! [`ServiceSession`] is the pure state machine: it turns incoming messages
//! into [`ServiceEvent`]s and tracks login and content readiness.
//! [`OnlineServiceConnection`] drives a session over a live [`Connection`],
//! logs in as soon as the transport is up, and forwards events to a
//! [`ServiceHandler`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::codec::MessageCodec;
use crate::connection::{Connection, ConnectionError, ConnectionEvent, WeakConnection};
use crate::events::lock;
use crate::messages::{LoginRequest, Message, SetProject, UpdateContent};

/// Login state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No successful login yet.
    NotLoggedIn,
    /// The server accepted the login.
    LoggedIn,
}

/// What a handled message means to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Login accepted for this user.
    LoggedIn {
        /// User owning the API key.
        user_name: String,
    },
    /// The server reported an error or rejected a message.
    Error(String),
    /// All project content has arrived. Raised once per session.
    ContentReady,
    /// A content entry was added or changed.
    ContentUpdated(UpdateContent),
    /// A content entry was removed.
    ContentDeleted(String),
    /// The server selected a project.
    ProjectSelected(SetProject),
}

/// Protocol state of one client session.
#[derive(Debug, Clone)]
pub struct ServiceSession {
    state: SessionState,
    content_ready: bool,
    project_name: String,
    user_name: Option<String>,
}

impl ServiceSession {
    /// Fresh session for `project_name`.
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            state: SessionState::NotLoggedIn,
            content_ready: false,
            project_name: project_name.into(),
            user_name: None,
        }
    }

    /// Process one incoming message.
    ///
    /// Returns `None` for messages a client does not act on. Errors never
    /// change the login state, and content readiness is reported only once.
    pub fn handle_message(&mut self, message: &Message) -> Option<ServiceEvent> {
        match message {
            Message::LoginSuccessful(login) => {
                self.state = SessionState::LoggedIn;
                self.user_name = Some(login.user_name.clone());
                Some(ServiceEvent::LoggedIn {
                    user_name: login.user_name.clone(),
                })
            }
            Message::ServerError(error) => Some(ServiceEvent::Error(error.error.clone())),
            Message::UnknownMessage(unknown) => Some(ServiceEvent::Error(unknown.text.clone())),
            Message::ContentReady => {
                if self.content_ready {
                    return None;
                }
                self.content_ready = true;
                Some(ServiceEvent::ContentReady)
            }
            Message::UpdateContent(update) => Some(ServiceEvent::ContentUpdated(update.clone())),
            Message::DeleteContent(delete) => {
                Some(ServiceEvent::ContentDeleted(delete.content_name.clone()))
            }
            Message::SetProject(project) => {
                self.project_name = project.project_name.clone();
                Some(ServiceEvent::ProjectSelected(project.clone()))
            }
            Message::LoginRequest(_)
            | Message::CheckProjectContent(_)
            | Message::TextMessage(_)
            | Message::LogInfo(_) => None,
        }
    }

    /// Current login state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the login was accepted.
    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    /// Whether the server announced that all content is present.
    pub fn is_content_ready(&self) -> bool {
        self.content_ready
    }

    /// Last project requested or selected.
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// User name from the login reply.
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }
}

/// Application callbacks for a service connection. Every method has a no-op
/// default. Callbacks run on the connection's read task.
pub trait ServiceHandler: Send + Sync + 'static {
    /// The server reported an error.
    fn server_error(&self, _error: &str) {}

    /// The login was accepted.
    fn logged_in(&self, _user_name: &str) {}

    /// Load local content metadata. Runs right before [`ServiceHandler::content_ready`].
    fn load_content_meta_data(&self) {}

    /// All content is present.
    fn content_ready(&self) {}

    /// A content entry was added or changed.
    fn content_updated(&self, _update: &UpdateContent) {}

    /// A content entry was removed.
    fn content_deleted(&self, _content_name: &str) {}

    /// The server selected a project. A returned message is sent back.
    fn project_selected(&self, _project: &SetProject) -> Option<Message> {
        None
    }

    /// Content did not become ready in time.
    fn timed_out(&self) {}
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ServiceHandler for NoopHandler {}

/// Errors surfaced to users of [`OnlineServiceConnection`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Content did not become ready within the timeout.
    #[error("connection timed out")]
    TimedOut,

    /// The server reported an error before content was ready.
    #[error("server error: {0}")]
    Server(String),

    /// The connection closed before content was ready.
    #[error("connection closed before content was ready")]
    Disconnected,

    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Progress towards content readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing decisive happened yet.
    Waiting,
    /// Content is ready.
    Ready,
    /// The server reported this error first.
    Failed(String),
    /// The connection closed first.
    Disconnected,
}

/// How long to wait for content readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTimeouts {
    /// Used when local content is cached. Default: 5s.
    pub cached: Duration,
    /// Used without local content. Default: 30s.
    pub uncached: Duration,
}

impl Default for ReadyTimeouts {
    fn default() -> Self {
        Self {
            cached: Duration::from_secs(5),
            uncached: Duration::from_secs(30),
        }
    }
}

impl ReadyTimeouts {
    /// Pick the timeout for the local cache situation.
    pub fn for_cache(&self, has_cached_content: bool) -> Duration {
        if has_cached_content {
            self.cached
        } else {
            self.uncached
        }
    }
}

/// Default ready timeout: short when content is cached locally, long otherwise.
pub fn ready_timeout(has_cached_content: bool) -> Duration {
    ReadyTimeouts::default().for_cache(has_cached_content)
}

/// A [`Connection`] speaking the online service protocol.
pub struct OnlineServiceConnection<C: MessageCodec<Message = Message>> {
    connection: Connection<C>,
    session: Arc<Mutex<ServiceSession>>,
    readiness: Arc<watch::Sender<Readiness>>,
    handler: Arc<dyn ServiceHandler>,
}

impl<C: MessageCodec<Message = Message>> OnlineServiceConnection<C> {
    /// Wrap a connection that has not connected yet.
    ///
    /// `credentials` is sent as soon as the transport is established.
    pub fn new(
        connection: Connection<C>,
        credentials: LoginRequest,
        handler: Arc<dyn ServiceHandler>,
    ) -> Self {
        let session = Arc::new(Mutex::new(ServiceSession::new(
            credentials.project_name.clone(),
        )));
        let (readiness, _) = watch::channel(Readiness::Waiting);
        let readiness = Arc::new(readiness);

        let context = Dispatch {
            connection: connection.downgrade(),
            session: Arc::clone(&session),
            readiness: Arc::clone(&readiness),
            handler: Arc::clone(&handler),
            credentials,
        };
        connection.subscribe(move |event| context.on_event(event));

        Self {
            connection,
            session,
            readiness,
            handler,
        }
    }

    /// Connect the underlying transport; the login follows automatically.
    pub async fn connect(&self, address: &str, port: u16) -> Result<(), ServiceError> {
        self.connection.connect(address, port).await?;
        Ok(())
    }

    /// Wait until the server announces content readiness.
    ///
    /// On timeout [`ServiceHandler::timed_out`] runs and
    /// [`ServiceError::TimedOut`] is returned.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ServiceError> {
        let mut rx = self.readiness.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state != Readiness::Waiting)
                .await
                .map(|state| state.clone())
        })
        .await;

        match outcome {
            Ok(Ok(Readiness::Ready)) => Ok(()),
            Ok(Ok(Readiness::Failed(error))) => Err(ServiceError::Server(error)),
            Ok(Ok(Readiness::Waiting | Readiness::Disconnected)) | Ok(Err(_)) => {
                Err(ServiceError::Disconnected)
            }
            Err(_) => {
                tracing::warn!("Content not ready after {timeout:?}");
                self.handler.timed_out();
                Err(ServiceError::TimedOut)
            }
        }
    }

    /// Send a message to the service.
    pub fn send(&self, message: &Message) -> Result<(), ServiceError> {
        self.connection.send(message)?;
        Ok(())
    }

    /// Close the connection.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Current readiness.
    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Snapshot of the protocol state.
    pub fn session(&self) -> ServiceSession {
        lock(&self.session).clone()
    }

    /// Whether the login was accepted.
    pub fn is_logged_in(&self) -> bool {
        lock(&self.session).is_logged_in()
    }

    /// Whether content is ready.
    pub fn is_content_ready(&self) -> bool {
        lock(&self.session).is_content_ready()
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &Connection<C> {
        &self.connection
    }
}

struct Dispatch<C: MessageCodec<Message = Message>> {
    connection: WeakConnection<C>,
    session: Arc<Mutex<ServiceSession>>,
    readiness: Arc<watch::Sender<Readiness>>,
    handler: Arc<dyn ServiceHandler>,
    credentials: LoginRequest,
}

impl<C: MessageCodec<Message = Message>> Dispatch<C> {
    fn on_event(&self, event: &ConnectionEvent<Message>) {
        match event {
            ConnectionEvent::Connected => self.login(),
            ConnectionEvent::DataReceived(message) => {
                let handled = lock(&self.session).handle_message(message);
                match handled {
                    Some(event) => self.dispatch(event),
                    None => tracing::debug!("Ignoring {} from service", message.type_name()),
                }
            }
            ConnectionEvent::Disconnected => {
                self.readiness.send_if_modified(|state| {
                    if *state == Readiness::Waiting {
                        *state = Readiness::Disconnected;
                        return true;
                    }
                    false
                });
            }
        }
    }

    fn login(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        tracing::info!("Logging in to project {}", self.credentials.project_name);
        if let Err(e) = connection.send(&Message::LoginRequest(self.credentials.clone())) {
            tracing::warn!("Login request not sent: {e}");
        }
    }

    fn dispatch(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::LoggedIn { user_name } => {
                tracing::info!("Logged in as {user_name}");
                self.handler.logged_in(&user_name);
            }
            ServiceEvent::Error(error) => {
                tracing::warn!("Service reported: {error}");
                self.readiness.send_if_modified(|state| {
                    if *state == Readiness::Waiting {
                        *state = Readiness::Failed(error.clone());
                        return true;
                    }
                    false
                });
                self.handler.server_error(&error);
            }
            ServiceEvent::ContentReady => {
                self.handler.load_content_meta_data();
                self.handler.content_ready();
                self.readiness.send_replace(Readiness::Ready);
            }
            ServiceEvent::ContentUpdated(update) => self.handler.content_updated(&update),
            ServiceEvent::ContentDeleted(name) => self.handler.content_deleted(&name),
            ServiceEvent::ProjectSelected(project) => {
                let Some(reply) = self.handler.project_selected(&project) else {
                    return;
                };
                let Some(connection) = self.connection.upgrade() else {
                    return;
                };
                if let Err(e) = connection.send(&reply) {
                    tracing::warn!("Reply to project selection not sent: {e}");
                }
            }
        }
    }
}
