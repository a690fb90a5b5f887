//! Image source resolution.
//!
//! Turns a job's source field into an ordered list of raw image buffers.
//! Accepted shapes:
//! - base64 data URLs (`data:image/png;base64,...`, or `data:application/zip;base64,...`)
//! - `http(s)://` URLs of single images
//! - `http(s)://` URLs of zip archives (detected by `.zip` suffix or the
//!   local-file signature of the body)

use std::io::{Cursor, Read};
use std::time::Duration;

use base64::Engine;
use reqwest::Client;

use crate::config::DEFAULT_MAX_SOURCE_BYTES;
use crate::error::JobError;
use crate::types::{ImageDescriptor, JobSource, ResponseMode, SkippedEntry};

const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";
const SINGLE_IMAGE_ID: &str = "single_image";

/// Everything a job's source resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedSources {
    /// Images in submission (or archive) order.
    pub descriptors: Vec<ImageDescriptor>,
    /// Archive entries that could not be read.
    pub skipped: Vec<SkippedEntry>,
    pub mode: ResponseMode,
}

enum Payload {
    Image(Vec<u8>),
    Archive(Vec<u8>),
}

/// Fetches and unpacks job sources.
pub struct SourceResolver<'a> {
    client: &'a Client,
    fetch_timeout: Duration,
    max_bytes: u64,
}

impl<'a> SourceResolver<'a> {
    pub fn new(client: &'a Client, fetch_timeout: Duration) -> Self {
        Self {
            client,
            fetch_timeout,
            max_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }

    /// Cap fetched bodies, data URL payloads, and unpacked archive entries.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Resolve a job source into image descriptors.
    ///
    /// # Errors
    ///
    /// - [`JobError::Input`] for malformed URLs, undecodable base64, sources
    ///   over the size cap, or fetch failures (connection, timeout, non-2xx status)
    /// - [`JobError::Archive`] for unreadable archives or archives with no images
    pub async fn resolve(&self, source: &JobSource) -> Result<ResolvedSources, JobError> {
        match source {
            JobSource::Single(url) => match self.load(url, true).await? {
                Payload::Image(bytes) => Ok(ResolvedSources {
                    descriptors: vec![ImageDescriptor {
                        identifier: identifier_for(url, SINGLE_IMAGE_ID),
                        bytes,
                    }],
                    skipped: Vec::new(),
                    mode: ResponseMode::Single,
                }),
                Payload::Archive(bytes) => {
                    let (descriptors, skipped) = extract_archive(&bytes, self.max_bytes)?;
                    tracing::info!(
                        "Extracted {} images from archive ({} skipped)",
                        descriptors.len(),
                        skipped.len()
                    );
                    Ok(ResolvedSources {
                        descriptors,
                        skipped,
                        mode: ResponseMode::Batch,
                    })
                }
            },
            JobSource::Many(urls) => {
                let mut descriptors = Vec::with_capacity(urls.len());
                for (i, url) in urls.iter().enumerate() {
                    let bytes = match self.load(url, false).await? {
                        Payload::Image(bytes) | Payload::Archive(bytes) => bytes,
                    };
                    descriptors.push(ImageDescriptor {
                        identifier: identifier_for(url, &format!("image_{}", i + 1)),
                        bytes,
                    });
                }
                Ok(ResolvedSources {
                    descriptors,
                    skipped: Vec::new(),
                    mode: ResponseMode::Batch,
                })
            }
        }
    }

    async fn load(&self, url: &str, allow_archive: bool) -> Result<Payload, JobError> {
        if url.starts_with("data:") {
            let (mime, bytes) = parse_data_url(url)?;
            if bytes.len() as u64 > self.max_bytes {
                return Err(JobError::input(format!(
                    "data URL payload is {} bytes, over the {} byte limit",
                    bytes.len(),
                    self.max_bytes
                )));
            }
            if allow_archive && is_zip_mime(&mime) {
                return Ok(Payload::Archive(bytes));
            }
            if !mime.starts_with("image/") {
                return Err(JobError::input(format!(
                    "Unsupported data URL type {:?}. Expected: data:image/...;base64,...",
                    mime
                )));
            }
            return Ok(Payload::Image(bytes));
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            let bytes = self.fetch(url).await?;
            if allow_archive && (has_zip_suffix(url) || bytes.starts_with(ZIP_SIGNATURE)) {
                return Ok(Payload::Archive(bytes));
            }
            return Ok(Payload::Image(bytes));
        }

        Err(JobError::input(format!(
            "Unsupported source {:?}: expected an http(s) URL or a base64 data URL",
            truncate(url, 64)
        )))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, JobError> {
        tracing::debug!("Fetching {}", url);
        let mut resp = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JobError::input(format!(
                        "Timed out after {:?} fetching {}",
                        self.fetch_timeout, url
                    ))
                } else {
                    JobError::input(format!("Failed to fetch {}: {}", url, e))
                }
            })?;

        if !resp.status().is_success() {
            return Err(JobError::input(format!(
                "Fetching {} returned HTTP {}",
                url,
                resp.status().as_u16()
            )));
        }

        let too_large = || {
            JobError::input(format!(
                "{} is larger than the {} byte limit",
                url, self.max_bytes
            ))
        };
        if resp.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| JobError::input(format!("Failed to read body of {}: {}", url, e)))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Split a base64 data URL into its MIME type and decoded payload.
pub fn parse_data_url(url: &str) -> Result<(String, Vec<u8>), JobError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| JobError::input("data URL must start with \"data:\""))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| JobError::input("data URL has no ',' separator"))?;

    let mut parts = meta.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(JobError::input(
            "Invalid data_url format. Expected: data:image/...;base64,...",
        ));
    }

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| JobError::input(format!("Invalid base64 payload in data URL: {}", e)))?;

    if bytes.is_empty() {
        return Err(JobError::input("data URL payload is empty"));
    }
    Ok((mime, bytes))
}

/// Read every file entry of a zip archive, in archive order.
///
/// Entries that fail to read or unpack to more than `max_entry_bytes` are
/// skipped and reported, not fatal.
pub fn extract_archive(
    bytes: &[u8],
    max_entry_bytes: u64,
) -> Result<(Vec<ImageDescriptor>, Vec<SkippedEntry>), JobError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| JobError::archive(format!("cannot open zip archive: {}", e)))?;

    let mut descriptors = Vec::new();
    let mut skipped = Vec::new();

    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping archive entry #{}: {}", i, e);
                skipped.push(SkippedEntry {
                    name: format!("entry #{}", i),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let name = entry.name().to_string();
        if entry.is_dir() || is_metadata_entry(&name) {
            continue;
        }

        let oversize = || SkippedEntry {
            name: name.clone(),
            reason: format!("unpacks to more than {} bytes", max_entry_bytes),
        };
        if entry.size() > max_entry_bytes {
            tracing::warn!("Skipping archive entry {}: {} bytes", name, entry.size());
            skipped.push(oversize());
            continue;
        }

        // Declared sizes can lie, so the read itself is bounded too
        let mut buf = Vec::with_capacity(entry.size() as usize);
        match entry.by_ref().take(max_entry_bytes.saturating_add(1)).read_to_end(&mut buf) {
            Ok(_) if buf.len() as u64 > max_entry_bytes => {
                tracing::warn!("Skipping archive entry {}: exceeds size cap", name);
                skipped.push(oversize());
            }
            Ok(_) => descriptors.push(ImageDescriptor {
                identifier: name,
                bytes: buf,
            }),
            Err(e) => {
                tracing::warn!("Skipping archive entry {}: {}", name, e);
                skipped.push(SkippedEntry {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    if descriptors.is_empty() {
        return Err(JobError::archive(format!(
            "archive contains no readable images ({} entries skipped)",
            skipped.len()
        )));
    }

    Ok((descriptors, skipped))
}

fn identifier_for(url: &str, positional: &str) -> String {
    if url.starts_with("data:") {
        positional.to_string()
    } else {
        url.to_string()
    }
}

fn is_zip_mime(mime: &str) -> bool {
    matches!(mime, "application/zip" | "application/x-zip-compressed")
}

fn has_zip_suffix(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".zip")
}

// macOS resource forks and dot-files
fn is_metadata_entry(name: &str) -> bool {
    name.starts_with("__MACOSX/") || name.split('/').any(|part| part.starts_with('.'))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn parses_image_data_url() {
        let (mime, bytes) = parse_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn data_url_tolerates_whitespace_in_payload() {
        let (_, bytes) = parse_data_url("data:image/jpeg;base64,aGVs\nbG8=").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn rejects_non_base64_data_url() {
        assert!(matches!(
            parse_data_url("data:image/png,hello"),
            Err(JobError::Input(_))
        ));
        assert!(matches!(
            parse_data_url("data:image/png;base64,!!!not-base64!!!"),
            Err(JobError::Input(_))
        ));
        assert!(parse_data_url("data:image/png;base64").is_err());
    }

    #[test]
    fn zip_suffix_ignores_query() {
        assert!(has_zip_suffix("https://x/batch.ZIP?token=abc"));
        assert!(!has_zip_suffix("https://x/cat.jpg?name=a.zip"));
    }

    #[test]
    fn extracts_entries_in_archive_order() {
        let bytes = zip_of(&[
            ("photos/", b""),
            ("photos/b.jpg", b"second-in-name-order"),
            ("photos/a.jpg", b"first-in-name-order"),
            ("__MACOSX/photos/._a.jpg", b"fork"),
            ("photos/.DS_Store", b"meta"),
        ]);
        let (descriptors, skipped) = extract_archive(&bytes, DEFAULT_MAX_SOURCE_BYTES).unwrap();
        let ids: Vec<_> = descriptors.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, vec!["photos/b.jpg", "photos/a.jpg"]);
        assert_eq!(descriptors[1].bytes, b"first-in-name-order");
        assert!(skipped.is_empty());
    }

    #[test]
    fn corrupt_entry_is_skipped() {
        let mut bytes = zip_of(&[
            ("good.png", b"GOOD-ENTRY-PAYLOAD"),
            ("bad.png", b"BAD-ENTRY-PAYLOAD"),
        ]);
        // Flip a stored byte so the entry fails its CRC check
        let pos = bytes
            .windows(b"BAD-ENTRY-PAYLOAD".len())
            .position(|w| w == b"BAD-ENTRY-PAYLOAD")
            .unwrap();
        bytes[pos] ^= 0xff;

        let (descriptors, skipped) = extract_archive(&bytes, DEFAULT_MAX_SOURCE_BYTES).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].identifier, "good.png");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "bad.png");
    }

    #[test]
    fn garbage_is_an_archive_error() {
        assert!(matches!(
            extract_archive(b"PK\x03\x04 definitely not a zip", DEFAULT_MAX_SOURCE_BYTES),
            Err(JobError::Archive(_))
        ));
    }

    #[test]
    fn empty_archive_is_an_archive_error() {
        let bytes = zip_of(&[("docs/", b"")]);
        assert!(matches!(
            extract_archive(&bytes, DEFAULT_MAX_SOURCE_BYTES),
            Err(JobError::Archive(_))
        ));
    }

    #[test]
    fn entry_inflating_past_cap_is_skipped() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.start_file("small.png", stored).unwrap();
        writer.write_all(b"tiny").unwrap();
        writer.start_file("bomb.png", deflated).unwrap();
        writer.write_all(&vec![0u8; 1024 * 1024]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(bytes.len() < 64 * 1024);

        let (descriptors, skipped) = extract_archive(&bytes, 1024).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].identifier, "small.png");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "bomb.png");
        assert!(skipped[0].reason.contains("1024 bytes"));
    }

    #[tokio::test]
    async fn oversized_data_url_is_input_error() {
        let client = Client::new();
        let resolver = SourceResolver::new(&client, Duration::from_secs(1)).with_max_bytes(4);
        let err = resolver
            .resolve(&JobSource::Single("data:image/png;base64,aGVsbG8=".into()))
            .await
            .unwrap_err();
        match err {
            JobError::Input(message) => assert!(message.contains("4 byte limit")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_is_input_error() {
        let client = Client::new();
        let resolver = SourceResolver::new(&client, Duration::from_secs(1));
        let err = resolver
            .resolve(&JobSource::Single("ftp://x/cat.jpg".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Input(_)));
    }

    #[tokio::test]
    async fn zip_data_url_resolves_to_batch() {
        use base64::engine::general_purpose::STANDARD;

        let archive = zip_of(&[("one.png", b"1"), ("two.png", b"2")]);
        let url = format!("data:application/zip;base64,{}", STANDARD.encode(&archive));

        let client = Client::new();
        let resolver = SourceResolver::new(&client, Duration::from_secs(1));
        let resolved = resolver.resolve(&JobSource::Single(url)).await.unwrap();
        assert_eq!(resolved.mode, ResponseMode::Batch);
        assert_eq!(resolved.descriptors.len(), 2);
    }

    #[tokio::test]
    async fn list_data_urls_get_positional_ids() {
        let client = Client::new();
        let resolver = SourceResolver::new(&client, Duration::from_secs(1));
        let resolved = resolver
            .resolve(&JobSource::Many(vec![
                "data:image/png;base64,aGVsbG8=".into(),
                "data:image/jpeg;base64,d29ybGQ=".into(),
            ]))
            .await
            .unwrap();
        let ids: Vec<_> = resolved
            .descriptors
            .iter()
            .map(|d| d.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["image_1", "image_2"]);
        assert_eq!(resolved.mode, ResponseMode::Batch);
    }
}
