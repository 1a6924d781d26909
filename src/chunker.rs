//! Chunkers: turn a tenant's files into [`Chunk`]s.
//!
//! Chunking sits outside the ingestion core, which only sees the [`Chunker`]
//! trait. Two implementations are provided, one per supported media kind:
//!
//! - **[`TextChunker`]** reads `.txt` files and splits them with a recursive
//!   character splitter (paragraphs, then lines, then words, then characters).
//! - **[`ImageChunker`]** captions `.png` / `.jpg` / `.jpeg` files through a
//!   [`Captioner`] and splits the caption the same way.
//!
//! Every chunk carries `user_id`, `file_path`, `mime_type` and `source`
//! metadata. Publish-time fields (`total_chunks`, ...) are stamped later by
//! the publisher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{CaptioningConfig, ChunkingConfig};
use crate::models::{Chunk, ChunkMetadata, MediaKind};

/// Separators tried in order; the empty string means "split into characters".
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Converts files of one media kind into chunks.
#[async_trait]
pub trait Chunker: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Chunk every path. Paths of the wrong kind, or that are not regular
    /// files, are logged and skipped.
    async fn process_files(&self, paths: &[PathBuf]) -> Result<Vec<Chunk>>;
}

/// Recursive character splitter with overlap, measured in characters.
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Split text into pieces no longer than `chunk_size` characters, except
    /// where a single unbreakable run is longer.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (idx, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, sep)| sep.is_empty() || text.contains(*sep))
            .map(|(i, sep)| (i, *sep))
            .unwrap_or((separators.len().saturating_sub(1), ""));
        let remaining = &separators[(idx + 1).min(separators.len())..];

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(|c| c.to_string()).collect()
        } else {
            text.split(separator)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        };

        let mut chunks = Vec::new();
        let mut good = Vec::new();
        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge(&good, separator));
                good.clear();
            }
            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_with(&piece, remaining));
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge(&good, separator));
        }
        chunks
    }

    /// Greedily join small pieces up to `chunk_size`, carrying at most
    /// `chunk_overlap` characters into the next chunk.
    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut out = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joined_len = |total: usize, window: &VecDeque<&str>| {
                total + len + if window.is_empty() { 0 } else { sep_len }
            };

            if joined_len(total, &window) > self.chunk_size && !window.is_empty() {
                push_joined(&mut out, &window, separator);
                while total > self.chunk_overlap
                    || (joined_len(total, &window) > self.chunk_size && total > 0)
                {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    total -= char_len(front) + if window.is_empty() { 0 } else { sep_len };
                }
            }
            total += len + if window.is_empty() { 0 } else { sep_len };
            window.push_back(piece);
        }
        push_joined(&mut out, &window, separator);
        out
    }
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

// ============ Text ============

/// Chunks plain-text files for one tenant.
pub struct TextChunker {
    tenant: String,
    splitter: TextSplitter,
}

impl TextChunker {
    pub fn new(tenant: &str, config: &ChunkingConfig) -> Self {
        Self {
            tenant: tenant.to_string(),
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
        }
    }
}

#[async_trait]
impl Chunker for TextChunker {
    fn kind(&self) -> MediaKind {
        MediaKind::Text
    }

    async fn process_files(&self, paths: &[PathBuf]) -> Result<Vec<Chunk>> {
        let mut all_chunks = Vec::new();

        for path in paths {
            if !path.is_file() || MediaKind::from_path(path) != Some(MediaKind::Text) {
                warn!(file = %path.display(), "Skipping invalid text file");
                continue;
            }

            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read text file: {}", path.display()))?;
            let file_path = path_string(path);
            let pieces = self.splitter.split(&text);
            info!(file = %file_path, chunks = pieces.len(), "Text file chunked");

            all_chunks.extend(pieces.into_iter().map(|content| Chunk {
                content,
                metadata: ChunkMetadata::new(&self.tenant, &file_path, MediaKind::Text.as_str()),
            }));
        }

        Ok(all_chunks)
    }
}

// ============ Image ============

/// Produces a textual description of an image.
#[async_trait]
pub trait Captioner: Send + Sync {
    /// `Ok(None)` means no description could be produced.
    async fn caption(&self, path: &Path) -> Result<Option<String>>;
}

/// Captioner used when no captioning service is configured.
pub struct NoCaptioner;

#[async_trait]
impl Captioner for NoCaptioner {
    async fn caption(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Captioner backed by an HTTP image-to-text service.
///
/// Sends `POST {url}` with `{"file_name": ..., "image": <base64>}` and reads
/// `{"caption": "..."}` back.
pub struct HttpCaptioner {
    client: reqwest::Client,
    url: String,
}

impl HttpCaptioner {
    pub fn new(url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Captioner for HttpCaptioner {
    async fn caption(&self, path: &Path) -> Result<Option<String>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image: {}", path.display()))?;
        let body = serde_json::json!({
            "file_name": path.file_name().map(|n| n.to_string_lossy().to_string()),
            "image": base64::engine::general_purpose::STANDARD.encode(&bytes),
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Captioning service error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        Ok(json
            .get("caption")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()))
    }
}

/// Build the captioner selected by configuration.
pub fn create_captioner(config: &CaptioningConfig) -> Result<Box<dyn Captioner>> {
    match &config.url {
        Some(url) => Ok(Box::new(HttpCaptioner::new(url, config.timeout_secs)?)),
        None => Ok(Box::new(NoCaptioner)),
    }
}

/// Chunks image files for one tenant via their caption.
pub struct ImageChunker {
    tenant: String,
    splitter: TextSplitter,
    captioner: Box<dyn Captioner>,
}

impl ImageChunker {
    pub fn new(tenant: &str, config: &ChunkingConfig, captioner: Box<dyn Captioner>) -> Self {
        Self {
            tenant: tenant.to_string(),
            splitter: TextSplitter::new(config.image_chunk_size, config.image_chunk_overlap),
            captioner,
        }
    }
}

#[async_trait]
impl Chunker for ImageChunker {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    async fn process_files(&self, paths: &[PathBuf]) -> Result<Vec<Chunk>> {
        let mut all_chunks = Vec::new();

        for path in paths {
            if !path.is_file() || MediaKind::from_path(path) != Some(MediaKind::Image) {
                warn!(file = %path.display(), "Skipping invalid image file");
                continue;
            }

            let file_path = path_string(path);
            let description = match self.captioner.caption(path).await? {
                Some(caption) => format!("Image description: {}", caption),
                None => {
                    warn!(file = %file_path, "No description available for image");
                    String::new()
                }
            };

            let mut pieces = self.splitter.split(&description);
            if pieces.is_empty() {
                pieces.push(String::new());
            }

            all_chunks.extend(pieces.into_iter().map(|piece| Chunk {
                content: format!("{} file_path: {}", piece, file_path)
                    .trim_start()
                    .to_string(),
                metadata: ChunkMetadata::new(&self.tenant, &file_path, MediaKind::Image.as_str()),
            }));
            info!(file = %file_path, "Image file chunked");
        }

        Ok(all_chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_small_text_single_chunk() {
        let splitter = TextSplitter::new(100, 10);
        assert_eq!(splitter.split("Hello, world!"), vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        let splitter = TextSplitter::new(100, 10);
        assert!(splitter.split("").is_empty());
        assert!(splitter.split("   \n\n  ").is_empty());
    }

    #[test]
    fn test_paragraphs_respect_size() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {} has a few words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let splitter = TextSplitter::new(120, 20);
        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(char_len(c) <= 120, "chunk too long: {}", char_len(c));
        }
        assert!(chunks[0].starts_with("Paragraph number 0"));
    }

    #[test]
    fn test_overlap_carries_tail_forward() {
        let text = "aaaa bbbb cccc dddd eeee ffff";
        let splitter = TextSplitter::new(10, 5);
        let chunks = splitter.split(text);
        assert_eq!(chunks, vec!["aaaa bbbb", "bbbb cccc", "cccc dddd", "dddd eeee", "eeee ffff"]);
    }

    #[test]
    fn test_unbreakable_run_falls_back_to_characters() {
        let text = "x".repeat(25);
        let splitter = TextSplitter::new(10, 0);
        let chunks = splitter.split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta gamma delta\n\nEpsilon zeta eta theta";
        let splitter = TextSplitter::new(12, 4);
        assert_eq!(splitter.split(text), splitter.split(text));
    }

    #[tokio::test]
    async fn test_text_chunker_sets_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        fs::write(&path, "First paragraph.\n\nSecond paragraph.").unwrap();

        let chunker = TextChunker::new("user_a", &ChunkingConfig::default());
        let chunks = chunker.process_files(&[path.clone()]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        let meta = &chunks[0].metadata;
        assert_eq!(meta.user_id, "user_a");
        assert_eq!(meta.file_path, path.to_string_lossy());
        assert_eq!(meta.mime_type, "text");
        assert!(meta.total_chunks.is_none());
    }

    #[tokio::test]
    async fn test_text_chunker_skips_wrong_kind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.pdf");
        fs::write(&path, "not really a pdf").unwrap();

        let chunker = TextChunker::new("user_a", &ChunkingConfig::default());
        let chunks = chunker
            .process_files(&[path, tmp.path().join("missing.txt")])
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    struct FixedCaptioner(&'static str);

    #[async_trait]
    impl Captioner for FixedCaptioner {
        async fn caption(&self, _path: &Path) -> Result<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[tokio::test]
    async fn test_image_chunker_uses_caption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cat.PNG");
        fs::write(&path, [0u8, 1, 2]).unwrap();

        let chunker = ImageChunker::new(
            "user_b",
            &ChunkingConfig::default(),
            Box::new(FixedCaptioner("a cat on a mat")),
        );
        let chunks = chunker.process_files(&[path.clone()]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].content,
            format!("Image description: a cat on a mat file_path: {}", path.display())
        );
        assert_eq!(chunks[0].metadata.mime_type, "image");
        assert_eq!(chunks[0].metadata.user_id, "user_b");
    }

    #[tokio::test]
    async fn test_image_without_caption_still_yields_chunk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blank.jpg");
        fs::write(&path, [0u8]).unwrap();

        let chunker = ImageChunker::new("u", &ChunkingConfig::default(), Box::new(NoCaptioner));
        let chunks = chunker.process_files(&[path.clone()]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, format!("file_path: {}", path.display()));
    }
}
