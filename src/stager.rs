//! Transient staging of inbound attachments.
//!
//! Voice messages are downloaded to a temp file, uploaded to the model's
//! file storage and inferred against; the local copy and the remote artifact
//! are both gone by the time the handler returns, whatever the outcome.
//! Photos stay in memory and never touch the filesystem.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::gemini::{self, GeminiClient, RemoteFile};

/// Errors from the media sub-steps, one variant per step. The handler maps
/// each to the fixed apology for that message kind.
#[derive(Debug)]
pub enum MediaError {
    Download(String),
    Decode(String),
    Upload(gemini::Error),
    Infer(gemini::Error),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::Download(e) => write!(f, "download failed: {e}"),
            MediaError::Decode(e) => write!(f, "decode failed: {e}"),
            MediaError::Upload(e) => write!(f, "upload failed: {e}"),
            MediaError::Infer(e) => write!(f, "inference failed: {e}"),
        }
    }
}

impl std::error::Error for MediaError {}

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(0);

/// A uniquely named temp file that is removed when the guard drops.
///
/// Removal failures are logged and swallowed; they never affect the reply
/// already produced for the user.
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Allocate a unique path in the OS temp dir. The file itself is created
    /// by whoever downloads into it.
    pub fn new(prefix: &str, extension: &str) -> Self {
        let id = NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "{prefix}_{}_{id}.{extension}",
            std::process::id()
        ));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged file {}", self.path.display()),
            // Nothing was ever downloaded into the path.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged file {}: {e}", self.path.display()),
        }
    }
}

/// The slice of the inference client the voice pipeline needs. Lets tests
/// substitute a recording stub for the real API.
pub trait MediaInference {
    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, gemini::Error>;
    async fn delete_file(&self, name: &str) -> Result<(), gemini::Error>;
    async fn infer_file(&self, prompt: &str, file: &RemoteFile) -> Result<String, gemini::Error>;
    async fn infer_image(
        &self,
        prompt: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<String, gemini::Error>;
}

impl MediaInference for GeminiClient {
    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, gemini::Error> {
        GeminiClient::upload_file(self, path, mime_type).await
    }

    async fn delete_file(&self, name: &str) -> Result<(), gemini::Error> {
        GeminiClient::delete_file(self, name).await
    }

    async fn infer_file(&self, prompt: &str, file: &RemoteFile) -> Result<String, gemini::Error> {
        self.generate_with_file(prompt, file).await
    }

    async fn infer_image(
        &self,
        prompt: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<String, gemini::Error> {
        self.generate_with_image(prompt, data, mime_type).await
    }
}

/// Upload an already-downloaded voice file, run inference against it, and
/// delete the remote artifact whether or not inference succeeded.
///
/// The local file is the caller's `StagedFile`; its guard removes it after
/// this returns, so remote deletion always comes first.
pub async fn run_voice<C: MediaInference>(
    client: &C,
    staged: &StagedFile,
    mime_type: &str,
    prompt: &str,
) -> Result<String, MediaError> {
    let remote = client
        .upload_file(staged.path(), mime_type)
        .await
        .map_err(MediaError::Upload)?;

    let outcome = client.infer_file(prompt, &remote).await;

    // The artifact goes away regardless of how inference went.
    if let Err(e) = client.delete_file(&remote.name).await {
        warn!("Failed to delete remote artifact {}: {e}", remote.name);
    }

    outcome.map_err(MediaError::Infer)
}

/// Photo pipeline: sniff the in-memory buffer's format and submit it inline.
/// Unlike voice, nothing here ever touches the filesystem.
pub async fn run_photo<C: MediaInference>(
    client: &C,
    data: &[u8],
    prompt: &str,
) -> Result<String, MediaError> {
    let mime_type = sniff_image_mime(data)?;
    debug!("Submitting inline image ({} bytes, {mime_type})", data.len());
    client
        .infer_image(prompt, data, mime_type)
        .await
        .map_err(MediaError::Infer)
}

/// Identify the container format of an in-memory image from its magic bytes.
pub fn sniff_image_mime(data: &[u8]) -> Result<&'static str, MediaError> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Ok("image/jpeg")
    } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Ok("image/png")
    } else if data.starts_with(b"GIF8") {
        Ok("image/gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Ok("image/webp")
    } else {
        Err(MediaError::Decode(format!(
            "unrecognized image format ({} bytes)",
            data.len()
        )))
    }
}
