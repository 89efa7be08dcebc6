//! End-to-end tests: registry, service host, and client connections over
//! loopback sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::messages::{LogInfo, LoginRequest, ServerError, TextMessage, UnknownMessage};
use crate::service_host::{LOGIN_REQUIRED, MISSING_API_KEY};
use crate::*;

fn codec() -> Arc<PostcardCodec<Message>> {
    Arc::new(PostcardCodec::new())
}

async fn start_host() -> (OnlineServiceHost<PostcardCodec<Message>>, u16) {
    let registry = MessageRegistry::new(codec(), RegistryConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    registry.start_with_listener(listener).unwrap();
    let host = OnlineServiceHost::new(registry, Arc::new(AcceptAnyKey::default()));
    (host, port)
}

async fn wait_for_clients(registry: &MessageRegistry, expected: usize) {
    for _ in 0..200 {
        if registry.number_of_connected_clients() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.number_of_connected_clients(), expected);
}

/// Collects the errors reported to the application.
#[derive(Default)]
struct ErrorLog {
    errors: Mutex<Vec<String>>,
}

impl ServiceHandler for ErrorLog {
    fn server_error(&self, error: &str) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

fn client_with(
    api_key: &str,
    handler: Arc<dyn ServiceHandler>,
) -> OnlineServiceConnection<PostcardCodec<Message>> {
    OnlineServiceConnection::new(
        MessageConnection::new(codec()),
        LoginRequest {
            api_key: api_key.to_string(),
            project_name: "Breakout".to_string(),
        },
        handler,
    )
}

fn client(api_key: &str) -> OnlineServiceConnection<PostcardCodec<Message>> {
    client_with(api_key, Arc::new(NoopHandler))
}

async fn next_message(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent<Message>>,
) -> Message {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("event channel closed");
        if let ConnectionEvent::DataReceived(message) = event {
            return message;
        }
    }
}

#[tokio::test]
async fn test_valid_key_logs_in_and_content_becomes_ready() {
    let (host, port) = start_host().await;
    let errors = Arc::new(ErrorLog::default());
    let service = client_with("key", Arc::clone(&errors) as Arc<dyn ServiceHandler>);

    service.connect("127.0.0.1", port).await.unwrap();
    service
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(errors.errors.lock().unwrap().is_empty());
    assert_eq!(service.session().state(), SessionState::LoggedIn);
    assert!(service.is_logged_in());
    assert_eq!(service.session().user_name(), Some("TestUser"));
    assert_eq!(host.logged_in_clients(), 1);
    host.shutdown();
}

#[tokio::test]
async fn test_empty_key_stays_logged_out() {
    let (host, port) = start_host().await;
    let errors = Arc::new(ErrorLog::default());
    let service = client_with("", Arc::clone(&errors) as Arc<dyn ServiceHandler>);

    service.connect("127.0.0.1", port).await.unwrap();
    let result = service.wait_until_ready(Duration::from_secs(5)).await;

    assert_eq!(*errors.errors.lock().unwrap(), vec![MISSING_API_KEY.to_string()]);
    assert!(matches!(result, Err(ServiceError::Server(ref e)) if e == MISSING_API_KEY));
    assert_eq!(service.session().state(), SessionState::NotLoggedIn);
    assert!(service.connection().is_connected(), "Protocol errors keep the connection");
    assert_eq!(host.logged_in_clients(), 0);
    host.shutdown();
}

#[tokio::test]
async fn test_host_rejects_unsupported_and_unauthenticated_messages() {
    let (host, port) = start_host().await;
    let connection = MessageConnection::new(codec());
    let mut rx = connection.event_channel();
    connection.connect("127.0.0.1", port).await.unwrap();

    connection
        .send(&Message::LogInfo(LogInfo {
            text: "early".to_string(),
        }))
        .unwrap();
    connection
        .send(&Message::TextMessage(TextMessage::from("Hi")))
        .unwrap();

    assert_eq!(
        next_message(&mut rx).await,
        Message::ServerError(ServerError {
            error: LOGIN_REQUIRED.to_string()
        })
    );
    assert_eq!(
        next_message(&mut rx).await,
        Message::UnknownMessage(UnknownMessage {
            text: "TextMessage is not supported".to_string()
        })
    );
    host.shutdown();
}

#[tokio::test]
async fn test_login_state_is_dropped_on_disconnect() {
    let (host, port) = start_host().await;
    let service = client("key");
    service.connect("127.0.0.1", port).await.unwrap();
    service
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(host.logged_in_clients(), 1);

    service.disconnect();
    for _ in 0..200 {
        if host.logged_in_clients() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(host.logged_in_clients(), 0);
    assert_eq!(host.registry().number_of_connected_clients(), 0);
}

#[tokio::test]
async fn test_messages_from_one_client_keep_their_order() {
    let registry = MessageRegistry::new(codec(), RegistryConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    registry.start_with_listener(listener).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    registry.subscribe(move |event| {
        if let RegistryEvent::ClientDataReceived(_, Message::TextMessage(text)) = event {
            sink.lock().unwrap().push(text.text.clone());
        }
    });

    let connection = MessageConnection::new(codec());
    connection.connect("127.0.0.1", port).await.unwrap();
    for value in ["A", "B", "C"] {
        connection
            .send(&Message::TextMessage(TextMessage::from(value)))
            .unwrap();
    }

    for _ in 0..200 {
        if received.lock().unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*received.lock().unwrap(), vec!["A", "B", "C"]);
    registry.shutdown();
}

#[tokio::test]
async fn test_frames_split_across_writes_are_reassembled() {
    let registry = MessageRegistry::new(codec(), RegistryConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    registry.start_with_listener(listener).unwrap();
    let mut events = registry.event_channel();

    let messages: Vec<Message> = ["first", "second", "third"]
        .into_iter()
        .map(|text| Message::TextMessage(TextMessage::from(text)))
        .collect();
    let mut bytes = Vec::new();
    for message in &messages {
        let payload = PostcardCodec::<Message>::new().encode(message).unwrap();
        bytes.extend(encode_frame(&payload).unwrap());
    }

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for chunk in bytes.chunks(3) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut received = Vec::new();
    while received.len() < messages.len() {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let RegistryEvent::ClientDataReceived(_, message) = event {
            received.push(message);
        }
    }
    assert_eq!(received, messages);
    registry.shutdown();
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let registry = MessageRegistry::new(codec(), RegistryConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    registry.start_with_listener(listener).unwrap();

    let connects: Vec<_> = (0..3)
        .map(|_| {
            tokio::spawn(async move {
                let connection = MessageConnection::new(codec());
                let rx = connection.event_channel();
                connection.connect("127.0.0.1", port).await.unwrap();
                (connection, rx)
            })
        })
        .collect();
    let mut clients = Vec::new();
    for connect in connects {
        clients.push(connect.await.unwrap());
    }
    wait_for_clients(&registry, 3).await;

    // One client leaving must not affect delivery to the others.
    let (gone, _) = clients.remove(0);
    gone.disconnect();
    wait_for_clients(&registry, 2).await;

    let report = registry.broadcast(&Message::ContentReady).unwrap();
    assert_eq!(report.delivered, 2);
    assert!(report.failed.is_empty());

    for (_, rx) in clients.iter_mut() {
        assert_eq!(next_message(rx).await, Message::ContentReady);
    }
    registry.shutdown();
}
