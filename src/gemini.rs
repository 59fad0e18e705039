//! Google Gemini API client: text generation, inline images, file uploads
//! and client-side multi-turn chat sessions.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const API_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiClient {
    api_key: String,
    model: String,
    temperature: f32,
    system_prompt: String,
    client: reqwest::Client,
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api(String),
    Parse(String),
    Io(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

/// Reference to a file uploaded to the Gemini Files API.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// Resource name, e.g. "files/abc-123". Used for deletion.
    pub name: String,
    /// URI handed back to generateContent as fileData.
    pub uri: String,
    pub mime_type: String,
}

/// An open multi-turn dialogue. Gemini keeps no server-side conversation
/// state, so the handle is the accumulated turn history itself.
#[derive(Debug, Default)]
pub struct ChatSession {
    contents: Vec<Content>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of turns (user + model) recorded so far.
    pub fn turns(&self) -> usize {
        self.contents.len()
    }

    /// Total characters of user-authored text in the history.
    #[cfg(test)]
    pub fn user_text_len(&self) -> usize {
        self.contents
            .iter()
            .filter(|c| c.role == "user")
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .map(str::len)
            .sum()
    }

    pub(crate) fn push_user(&mut self, text: &str) {
        self.contents.push(Content::user(vec![Part::text(text)]));
    }

    pub(crate) fn push_model(&mut self, text: &str) {
        self.contents.push(Content::model(text));
    }

    /// Run one user turn through `infer` and record the exchange.
    ///
    /// The history gains the user and model turns only when `infer`
    /// succeeds; on failure it is left exactly as it was.
    pub(crate) async fn exchange<F, Fut>(&mut self, text: &str, infer: F) -> Result<String, Error>
    where
        F: FnOnce(Vec<Content>) -> Fut,
        Fut: std::future::Future<Output = Result<String, Error>>,
    {
        let mut attempt = self.contents.clone();
        attempt.push(Content::user(vec![Part::text(text)]));

        let reply = infer(attempt).await?;

        self.push_user(text);
        self.push_model(&reply);
        Ok(reply)
    }
}

#[derive(Serialize, Clone, Debug)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn user(parts: Vec<Part>) -> Self {
        Self { role: "user".to_string(), parts }
    }

    fn model(text: &str) -> Self {
        Self { role: "model".to_string(), parts: vec![Part::text(text)] }
    }
}

#[derive(Serialize, Clone, Debug, Default)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(rename = "fileData", skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self { text: Some(text.to_string()), ..Default::default() }
    }

    fn inline(mime_type: &str, data: String) -> Self {
        Self {
            inline_data: Some(InlineData { mime_type: mime_type.to_string(), data }),
            ..Default::default()
        }
    }

    fn file(mime_type: &str, uri: &str) -> Self {
        Self {
            file_data: Some(FileData {
                mime_type: mime_type.to_string(),
                file_uri: uri.to_string(),
            }),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Clone, Debug)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize, Clone, Debug)]
struct FileData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "fileUri")]
    file_uri: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: &'a [Content],
    #[serde(rename = "systemInstruction")]
    system_instruction: SystemInstruction,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

fn safety_settings() -> Vec<SafetySetting> {
    const CATEGORIES: [&str; 4] = [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ];
    CATEGORIES
        .into_iter()
        .map(|category| SafetySetting { category, threshold: "BLOCK_MEDIUM_AND_ABOVE" })
        .collect()
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct UploadResponse {
    file: Option<UploadedFile>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct UploadedFile {
    name: String,
    uri: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, temperature: f32, system_prompt: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            api_key,
            model,
            temperature,
            system_prompt: system_prompt.to_string(),
            client,
        }
    }

    /// Single-shot generation with an inline image.
    pub async fn generate_with_image(
        &self,
        prompt: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<String, Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let contents = [Content::user(vec![Part::text(prompt), Part::inline(mime_type, encoded)])];
        self.generate(&contents).await
    }

    /// Single-shot generation referencing a previously uploaded file.
    pub async fn generate_with_file(
        &self,
        prompt: &str,
        file: &RemoteFile,
    ) -> Result<String, Error> {
        let contents = [Content::user(vec![
            Part::text(prompt),
            Part::file(&file.mime_type, &file.uri),
        ])];
        self.generate(&contents).await
    }

    /// Continue a chat session with a new user message.
    ///
    /// The session history is only extended (user turn + model turn) when the
    /// request succeeds; a failed request leaves it untouched.
    pub async fn send_chat(
        &self,
        session: &mut ChatSession,
        text: &str,
    ) -> Result<String, Error> {
        session
            .exchange(text, |contents| self.generate_owned(contents))
            .await
    }

    async fn generate_owned(&self, contents: Vec<Content>) -> Result<String, Error> {
        self.generate(&contents).await
    }

    /// Upload a local file to the Gemini Files API.
    ///
    /// The file is read fully into memory before the request is sent.
    pub async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, Error> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;

        info!("Uploading {} bytes ({mime_type}) to Gemini", bytes.len());

        let url = format!("{API_BASE}/upload/v1beta/files?key={}&uploadType=media", self.api_key);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Api(format!("upload failed {status}: {body}")));
        }

        let remote = parse_upload(&body, mime_type)?;
        info!("Uploaded as {}", remote.name);
        Ok(remote)
    }

    /// Delete an uploaded file by its resource name (e.g. "files/abc-123").
    pub async fn delete_file(&self, name: &str) -> Result<(), Error> {
        debug!("Deleting remote file {name}");

        let url = format!("{API_BASE}/v1beta/{name}?key={}", self.api_key);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("delete failed {status}: {body}")));
        }

        Ok(())
    }

    async fn generate(&self, contents: &[Content]) -> Result<String, Error> {
        let request = GenerateRequest {
            contents,
            system_instruction: SystemInstruction {
                parts: vec![Part::text(&self.system_prompt)],
            },
            generation_config: GenerationConfig { temperature: self.temperature },
            safety_settings: safety_settings(),
        };

        let url = format!(
            "{API_BASE}/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        debug!("Gemini response status: {status}");

        if !status.is_success() {
            return Err(Error::Api(format!("{status}: {body}")));
        }

        extract_text(&body)
    }
}

/// Pull the generated text out of a generateContent response body.
fn extract_text(body: &str) -> Result<String, Error> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    if let Some(error) = parsed.error {
        return Err(Error::Api(error.message));
    }

    let text: String = parsed
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.is_empty() {
        return Err(Error::Empty);
    }

    Ok(text)
}

fn parse_upload(body: &str, fallback_mime: &str) -> Result<RemoteFile, Error> {
    let parsed: UploadResponse =
        serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    if let Some(error) = parsed.error {
        return Err(Error::Api(error.message));
    }

    let file = parsed.file.ok_or_else(|| Error::Parse("no file in upload response".into()))?;
    Ok(RemoteFile {
        name: file.name,
        uri: file.uri,
        mime_type: file.mime_type.unwrap_or_else(|| fallback_mime.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_success() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "Hello "}, {"text": "world"}], "role": "model"}}
            ]
        }"#;
        assert_eq!(extract_text(body).unwrap(), "Hello world");
    }

    #[test]
    fn test_extract_text_api_error() {
        let body = r#"{"error": {"message": "quota exceeded"}}"#;
        let err = extract_text(body).unwrap_err();
        assert!(matches!(err, Error::Api(_)));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_extract_text_empty_candidates() {
        let body = r#"{"candidates": []}"#;
        assert!(matches!(extract_text(body), Err(Error::Empty)));
    }

    #[test]
    fn test_extract_text_invalid_json() {
        assert!(matches!(extract_text("not json"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_upload() {
        let body = r#"{"file": {"name": "files/abc-123", "uri": "https://example/files/abc-123", "mimeType": "audio/ogg"}}"#;
        let file = parse_upload(body, "audio/mpeg").unwrap();
        assert_eq!(file.name, "files/abc-123");
        assert_eq!(file.uri, "https://example/files/abc-123");
        assert_eq!(file.mime_type, "audio/ogg");
    }

    #[test]
    fn test_parse_upload_fallback_mime() {
        let body = r#"{"file": {"name": "files/x", "uri": "https://example/files/x"}}"#;
        let file = parse_upload(body, "audio/ogg").unwrap();
        assert_eq!(file.mime_type, "audio/ogg");
    }

    #[test]
    fn test_part_serialization_skips_unset_fields() {
        let part = Part::inline("image/png", "QUJD".to_string());
        let value = serde_json::to_value(&part).unwrap();
        assert!(value.get("text").is_none());
        assert_eq!(value["inlineData"]["mimeType"], "image/png");
        assert_eq!(value["inlineData"]["data"], "QUJD");
    }

    #[tokio::test]
    async fn test_exchange_records_both_turns_on_success() {
        let mut session = ChatSession::new();
        let reply = session
            .exchange("Hello", |contents| async move {
                // The request carries the new user turn.
                assert_eq!(contents.len(), 1);
                Ok("Hi there!".to_string())
            })
            .await
            .unwrap();

        assert_eq!(reply, "Hi there!");
        assert_eq!(session.turns(), 2);
        assert_eq!(session.user_text_len(), "Hello".len());
    }

    #[tokio::test]
    async fn test_failed_exchange_leaves_fresh_history_empty() {
        let mut session = ChatSession::new();
        let result = session
            .exchange("Hello", |_contents| async {
                Err::<String, _>(Error::Api("model overloaded".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Api(_))));
        assert_eq!(session.turns(), 0);
    }

    #[tokio::test]
    async fn test_failed_exchange_keeps_prior_history() {
        let mut session = ChatSession::new();
        session.push_user("Hello");
        session.push_model("Hi!");

        let result = session
            .exchange("What did I just say?", |_contents| async {
                Err::<String, _>(Error::Http("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Http(_))));
        // Exactly the two earlier turns, nothing from the failed attempt.
        assert_eq!(session.turns(), 2);
        assert_eq!(session.user_text_len(), "Hello".len());
    }

    #[test]
    fn test_chat_session_accumulates_history() {
        let mut session = ChatSession::new();
        assert_eq!(session.turns(), 0);

        session.push_user("Hello");
        session.push_model("Hi there!");
        session.push_user("What did I just say?");
        session.push_model("You said hello.");

        assert_eq!(session.turns(), 4);
        // The handle has seen both user messages.
        assert_eq!(session.user_text_len(), "Hello".len() + "What did I just say?".len());
    }
}
