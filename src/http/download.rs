use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use url::Url;

/// Default size of one download chunk in bytes
pub const DOWNLOAD_CHUNK_SIZE: usize = 512_000;

/// Result of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub path: PathBuf,
    pub bytes: u64,

    /// Write cycles performed
    pub chunks: usize,
}

/// Streams response bodies to disk in fixed-size chunks
#[derive(Debug, Clone)]
pub struct DownloadSink {
    chunk_size: usize,
}

impl DownloadSink {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `body` into `dir/filename`, creating `dir` if needed.
    ///
    /// An existing file is truncated. Memory use is bounded by one chunk.
    pub async fn save<R>(&self, body: &mut R, dir: &Path, filename: &str) -> io::Result<DownloadSummary>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename == "." || filename == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid download filename: {:?}", filename),
            ));
        }

        // Create the target directory
        fs::create_dir_all(dir).await?;
        let path = dir.join(filename);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes = 0u64;
        let mut chunks = 0usize;

        loop {
            let filled = fill_chunk(body, &mut buffer).await?;
            if filled == 0 {
                break;
            }

            file.write_all(&buffer[..filled]).await?;
            file.flush().await?;

            bytes += filled as u64;
            chunks += 1;
        }

        debug!("Wrote {} bytes to {} in {} chunks", bytes, path.display(), chunks);

        Ok(DownloadSummary { path, bytes, chunks })
    }
}

impl Default for DownloadSink {
    fn default() -> Self {
        Self::new(DOWNLOAD_CHUNK_SIZE)
    }
}

/// Read until the buffer is full or the body ends; returns the bytes read
async fn fill_chunk<R>(body: &mut R, buffer: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let read = body.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// File name for a download that names none: the last URL path segment
pub fn filename_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .unwrap_or_else(|| "index.html".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_large_body_in_fixed_chunks() {
        let dir = TempDir::new().unwrap();
        let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();

        let sink = DownloadSink::new(500_000);
        let mut body = payload.as_slice();
        let summary = sink.save(&mut body, dir.path(), "big.bin").await.unwrap();

        assert_eq!(summary.chunks, 4);
        assert_eq!(summary.bytes, 2_000_000);
        assert_eq!(std::fs::read(&summary.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_small_reads_are_coalesced() {
        let dir = TempDir::new().unwrap();
        let mut body = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"defg")
            .build();

        let summary = DownloadSink::new(4).save(&mut body, dir.path(), "letters.txt").await.unwrap();

        assert_eq!(summary.chunks, 2);
        assert_eq!(std::fs::read_to_string(&summary.path).unwrap(), "abcdefg");
    }

    #[tokio::test]
    async fn test_creates_nested_dir_and_truncates() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let sink = DownloadSink::default();

        let mut long = &b"a much longer first body"[..];
        sink.save(&mut long, &nested, "page.html").await.unwrap();

        let mut short = &b"short"[..];
        let summary = sink.save(&mut short, &nested, "page.html").await.unwrap();
        assert_eq!(std::fs::read_to_string(summary.path).unwrap(), "short");
    }

    #[tokio::test]
    async fn test_empty_body_writes_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut body = &b""[..];

        let summary = DownloadSink::default().save(&mut body, dir.path(), "empty").await.unwrap();
        assert_eq!(summary.chunks, 0);
        assert!(summary.path.exists());
    }

    #[tokio::test]
    async fn test_rejects_path_in_filename() {
        let dir = TempDir::new().unwrap();
        let mut body = &b"x"[..];

        let err = DownloadSink::default().save(&mut body, dir.path(), "../escape").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_filename_for() {
        assert_eq!(filename_for(&Url::parse("http://x.test/files/report.pdf?v=2").unwrap()), "report.pdf");
        assert_eq!(filename_for(&Url::parse("http://x.test/").unwrap()), "index.html");
        assert_eq!(filename_for(&Url::parse("http://x.test").unwrap()), "index.html");
    }
}
