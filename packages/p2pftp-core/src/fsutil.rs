//! # File Utilities
//!
//! Positional reads and writes plus streaming MD5, all routed through
//! `spawn_blocking` so transfer tasks never block the runtime.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

fn read_at_sync(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.read_exact_at(buf, offset)
    }
    #[cfg(windows)]
    {
        let mut pos = 0;
        while pos < buf.len() {
            let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of file",
                ));
            }
            pos += n;
        }
        Ok(())
    }
}

fn write_at_sync(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(buf, offset)
    }
    #[cfg(windows)]
    {
        let mut pos = 0;
        while pos < buf.len() {
            let n = file.seek_write(&buf[pos..], offset + pos as u64)?;
            pos += n;
        }
        Ok(())
    }
}

/// Read exactly `len` bytes at `offset`.
pub async fn read_chunk_at(file: Arc<File>, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        read_at_sync(&file, offset, &mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Write `data` at `offset`.
pub async fn write_chunk_at(file: Arc<File>, offset: u64, data: Bytes) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_at_sync(&file, offset, &data))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Create a file pre-sized to `size` bytes (sparse where the platform
/// allows), truncating anything already at `path`.
pub async fn create_sized(path: &Path, size: u64) -> io::Result<Arc<File>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(Arc::new(file))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn hash_reader_sync(file: &File, size: u64) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    while offset < size {
        let want = buf.len().min((size - offset) as usize);
        read_at_sync(file, offset, &mut buf[..want])?;
        hasher.update(&buf[..want]);
        offset += want as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of the first `size` bytes of an open file, as 32 lowercase hex.
pub async fn md5_of(file: Arc<File>, size: u64) -> io::Result<String> {
    tokio::task::spawn_blocking(move || hash_reader_sync(&file, size))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// MD5 of a file on disk, as 32 lowercase hex.
pub async fn md5_of_path(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        hash_reader_sync(&file, size)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_md5_known_vectors() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty");
        File::create(&empty).unwrap();
        assert_eq!(
            md5_of_path(&empty).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );

        let abc = dir.path().join("abc");
        File::create(&abc).unwrap().write_all(b"abc").unwrap();
        assert_eq!(
            md5_of_path(&abc).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[tokio::test]
    async fn test_positional_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let file = create_sized(&path, 10).await.unwrap();

        // Write out of order; positional writes make order irrelevant.
        write_chunk_at(Arc::clone(&file), 5, Bytes::from_static(b"world"))
            .await
            .unwrap();
        write_chunk_at(Arc::clone(&file), 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let head = read_chunk_at(Arc::clone(&file), 0, 5).await.unwrap();
        let tail = read_chunk_at(Arc::clone(&file), 5, 5).await.unwrap();
        assert_eq!(head, b"hello");
        assert_eq!(tail, b"world");
    }

    #[tokio::test]
    async fn test_create_sized_presizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse");
        let file = create_sized(&path, 4096).await.unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }
}
