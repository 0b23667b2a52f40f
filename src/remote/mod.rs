//! Remote directory access: paged listings, whole-file retrieval and bz2
//! decompression of retrieved blobs.
//!
//! Callers depend on the [`RemoteDirectory`] trait; [`ftp::FtpDirectory`] is
//! the production implementation.

use async_trait::async_trait;
use std::fmt;
use std::io::Read;
use thiserror::Error;

use crate::model::RemoteFileEntry;

pub mod ftp;

pub use ftp::FtpDirectory;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O failed: {0}")]
    Io(String),
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("remote operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] std::io::Error),
}

#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// Start a fresh listing of `folder`. Every call starts from the first page.
    async fn list(&self, folder: &str) -> Result<Listing, RemoteError>;

    /// Retrieve the file at `path` fully into memory.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError>;
}

/// A finite, lazily materialised listing consumed one page at a time.
/// Entries come out in server order.
pub struct Listing {
    entries: Box<dyn Iterator<Item = RemoteFileEntry> + Send>,
}

impl Listing {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = RemoteFileEntry>,
        I::IntoIter: Send + 'static,
    {
        Self {
            entries: Box::new(entries.into_iter()),
        }
    }

    /// Next page of at most `page_size` entries, or `None` once exhausted.
    pub fn next_page(&mut self, page_size: usize) -> Option<Vec<RemoteFileEntry>> {
        let page: Vec<_> = self.entries.by_ref().take(page_size.max(1)).collect();
        if page.is_empty() {
            None
        } else {
            Some(page)
        }
    }
}

impl fmt::Debug for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listing").finish_non_exhaustive()
    }
}

/// Decompress a single bz2 stream held in memory.
pub fn decompress_bz2(data: &[u8]) -> Result<Vec<u8>, RemoteError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4));
    bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Join a configured folder and a file token into a remote path.
pub fn remote_path(folder: &str, token: &str) -> String {
    if folder.is_empty() || folder.ends_with('/') {
        format!("{}{}", folder, token)
    } else {
        format!("{}/{}", folder, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn listing_pages_in_server_order() {
        let entries: Vec<_> = (0..25)
            .map(|i| RemoteFileEntry::file(format!("f{}", i), 1, i))
            .collect();
        let mut listing = Listing::new(entries);
        let first = listing.next_page(10).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].name, "f0");
        assert_eq!(listing.next_page(10).unwrap().len(), 10);
        let last = listing.next_page(10).unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[4].name, "f24");
        assert!(listing.next_page(10).is_none());
    }

    #[test]
    fn decompress_roundtrip() {
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(b"PROJECT;MODEL\nMSWRMOS;mix\n").unwrap();
        let compressed = enc.finish().unwrap();
        let raw = decompress_bz2(&compressed).unwrap();
        assert_eq!(raw, b"PROJECT;MODEL\nMSWRMOS;mix\n");
    }

    #[test]
    fn decompress_rejects_garbage() {
        let err = decompress_bz2(b"definitely not bzip2").unwrap_err();
        assert!(matches!(err, RemoteError::Decode(_)));
    }

    #[test]
    fn remote_path_joins_with_single_slash() {
        assert_eq!(remote_path("", "a.bz2"), "a.bz2");
        assert_eq!(remote_path("/data/", "a.bz2"), "/data/a.bz2");
        assert_eq!(remote_path("/data", "a.bz2"), "/data/a.bz2");
    }
}
