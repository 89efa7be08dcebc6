//! Network message types for the online content service.
//!
//! The enum discriminant is the wire type tag (see [`crate::codec`]). Dispatch
//! sites match exhaustively on [`Message`], so adding a variant points at every
//! place that has to decide what to do with it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Auth ---
    /// Client asks to log in with a developer API key.
    LoginRequest(LoginRequest),
    /// Server accepted the login.
    LoginSuccessful(LoginSuccessful),

    // --- Diagnostics ---
    /// Server reports a failure while handling a request.
    ServerError(ServerError),
    /// Server received a message type it does not handle.
    UnknownMessage(UnknownMessage),

    // --- Content sync ---
    /// Server announces that all content for the project has been sent.
    ContentReady,
    /// Server selects the project whose content is synchronized.
    SetProject(SetProject),
    /// Client reports its current content metadata for comparison.
    CheckProjectContent(CheckProjectContent),
    /// Server pushes a new or changed content entry with its files.
    UpdateContent(UpdateContent),
    /// Server removes a content entry.
    DeleteContent(DeleteContent),

    // --- General ---
    /// Free text, mostly for tests and tooling.
    TextMessage(TextMessage),
    /// Log line forwarded to the service. Requires a login.
    LogInfo(LogInfo),
}

impl Message {
    /// Short type name used in diagnostics sent back to peers.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::LoginRequest(_) => "LoginRequest",
            Message::LoginSuccessful(_) => "LoginSuccessful",
            Message::ServerError(_) => "ServerError",
            Message::UnknownMessage(_) => "UnknownMessage",
            Message::ContentReady => "ContentReady",
            Message::SetProject(_) => "SetProject",
            Message::CheckProjectContent(_) => "CheckProjectContent",
            Message::UpdateContent(_) => "UpdateContent",
            Message::DeleteContent(_) => "DeleteContent",
            Message::TextMessage(_) => "TextMessage",
            Message::LogInfo(_) => "LogInfo",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Login request sent right after the connection is established.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginRequest {
    /// Developer API key. Empty keys are rejected.
    pub api_key: String,
    /// Project the client wants to work on.
    pub project_name: String,
}

/// Login confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginSuccessful {
    /// Name of the user owning the API key.
    pub user_name: String,
}

/// Server-side failure description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerError {
    /// Human-readable error.
    pub error: String,
}

/// Reply to a message type the server does not support.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnknownMessage {
    /// Human-readable explanation.
    pub text: String,
}

/// Access level granted for a project.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProjectPermissions {
    /// No access; the project must not be used.
    None,
    /// Content can be downloaded.
    Read,
    /// Content can be downloaded and changed.
    Full,
}

/// Project selection pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetProject {
    /// Project name.
    pub project_name: String,
    /// Access level of the logged-in user.
    pub permissions: ProjectPermissions,
}

/// Client's serialized content metadata index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckProjectContent {
    /// Metadata index as stored locally.
    pub content_meta_data: String,
}

/// Kind of a content entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Bitmap image.
    Image,
    /// Image atlas with several sub-images.
    ImageAnimation,
    /// Short sound effect.
    Sound,
    /// Streamed music.
    Music,
    /// Video clip.
    Video,
    /// XML document.
    Xml,
    /// JSON document.
    Json,
    /// Shader program.
    Shader,
    /// Material definition.
    Material,
    /// 3D model.
    Model,
    /// Particle effect definition.
    ParticleEmitter,
    /// Font description.
    Font,
    /// Scene or project root.
    Scene,
}

/// Metadata describing one content entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentMetaData {
    /// Unique content name, looked up case-insensitively.
    pub name: String,
    /// Content kind.
    pub content_type: ContentType,
    /// Unix time of the last change, in seconds.
    pub last_time_updated: u64,
    /// Optional language tag for localized content.
    pub language: Option<String>,
    /// File name relative to the content directory, if the entry has a file.
    pub local_file_path: Option<String>,
    /// Platform-specific file id, 0 if unused.
    pub platform_file_id: i32,
    /// File size in bytes, 0 if unknown.
    pub file_size: i32,
    /// Additional type-specific values.
    pub values: BTreeMap<String, String>,
}

impl ContentMetaData {
    /// Create an entry with only a name and type set.
    pub fn new(name: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            name: name.into(),
            content_type,
            last_time_updated: 0,
            language: None,
            local_file_path: None,
            platform_file_id: 0,
            file_size: 0,
            values: BTreeMap::new(),
        }
    }

    /// Set the local file path.
    pub fn with_local_file_path(mut self, path: impl Into<String>) -> Self {
        self.local_file_path = Some(path.into());
        self
    }
}

/// One file shipped with an [`UpdateContent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentFile {
    /// File name relative to the content directory.
    pub name: String,
    /// Raw file bytes.
    pub data: Vec<u8>,
}

/// New or changed content entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateContent {
    /// Metadata of the entry.
    pub meta_data: ContentMetaData,
    /// Files belonging to the entry.
    pub files: Vec<ContentFile>,
}

/// Removal of a content entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteContent {
    /// Name of the entry to delete.
    pub content_name: String,
}

/// Plain text message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextMessage {
    /// Message text.
    pub text: String,
}

/// Log line forwarded to the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogInfo {
    /// Log text.
    pub text: String,
}

impl From<&str> for TextMessage {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}
