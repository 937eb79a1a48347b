//! On-the-fly archive assembly for the download endpoints: `.zip` and
//! `.tgz` bundles built from the release/result files on disk.
//!
//! Release files are stored gzipped (`data/release/<repo>/<id>/<name>.gz`).
//! For zip output, rather than re-inflating and re-deflating, the DEFLATE
//! payload is spliced straight out of the gzip container after stripping
//! its header and trailer — the archive is otherwise produced the
//! canonical way.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::{DingError, Result};

/// One file to include in an archive: its name inside the archive and
/// its on-disk source.
pub struct ArchiveEntry<'a> {
    pub name: &'a str,
    pub path: &'a std::path::Path,
    /// True if `path` is gzip-compressed on disk (release artifacts are;
    /// result files served straight from the checkout are not).
    pub gzipped: bool,
}

/// Builds a `.tgz` (gzip-compressed tar) containing `entries`, decoding
/// any gzipped source file to its raw bytes first since tar entries are
/// not independently compressed.
pub async fn build_tgz(entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>> {
    let mut raw_entries = Vec::with_capacity(entries.len());
    for entry in entries {
        let data = read_raw(entry).await?;
        raw_entries.push((entry.name.to_string(), data));
    }

    tokio::task::spawn_blocking(move || {
        let gz_buf = Vec::new();
        let encoder = flate2::write::GzEncoder::new(gz_buf, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in &raw_entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data.as_slice())
                .map_err(DingError::Io)?;
        }
        let encoder = builder
            .into_inner()
            .map_err(DingError::Io)?;
        encoder.finish().map_err(DingError::Io)
    })
    .await
    .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?
}

/// Builds a `.zip` archive containing `entries`. Gzipped sources have
/// their DEFLATE payload spliced directly into the zip's deflate-method
/// entry, skipping the decompress/recompress round-trip; non-gzipped
/// sources are stored.
pub async fn build_zip(entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>> {
    let mut spliced = Vec::with_capacity(entries.len());
    for entry in entries {
        let data = tokio::fs::read(entry.path).await.map_err(DingError::Io)?;
        spliced.push((entry.name.to_string(), entry.gzipped, data));
    }

    tokio::task::spawn_blocking(move || {
        let buf = Vec::new();
        let mut writer = ZipWriter::new(std::io::Cursor::new(buf));
        for (name, gzipped, data) in &spliced {
            if *gzipped {
                let deflate = extract_deflate_payload(data)?;
                let options = SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                writer
                    .start_file(name, options)
                    .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?;
                writer.write_raw(&deflate).map_err(DingError::Io)?;
            } else {
                let options = SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored);
                writer
                    .start_file(name, options)
                    .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?;
                writer.write_all(data).map_err(DingError::Io)?;
            }
        }
        let cursor = writer
            .finish()
            .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?;
        Ok(cursor.into_inner())
    })
    .await
    .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?
}

async fn read_raw(entry: &ArchiveEntry<'_>) -> Result<Vec<u8>> {
    let data = tokio::fs::read(entry.path).await.map_err(DingError::Io)?;
    if !entry.gzipped {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(data.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(DingError::Io)?;
    Ok(out)
}

/// Strips the gzip header and trailer (CRC32 + ISIZE), leaving only the
/// raw DEFLATE stream — which is exactly what a zip "deflated" entry
/// needs. Gzip's minimal header is 10 bytes; optional fields (FNAME,
/// FEXTRA, FCOMMENT) are accounted for rather than assumed absent.
fn extract_deflate_payload(gz: &[u8]) -> Result<Vec<u8>> {
    if gz.len() < 18 || gz[0] != 0x1f || gz[1] != 0x8b {
        return Err(DingError::Configuration(
            "not a valid gzip stream".to_string(),
        ));
    }
    let flags = gz[3];
    let mut offset = 10usize;
    if flags & 0x04 != 0 {
        // FEXTRA
        let xlen = u16::from_le_bytes([gz[offset], gz[offset + 1]]) as usize;
        offset += 2 + xlen;
    }
    if flags & 0x08 != 0 {
        // FNAME
        offset += gz[offset..].iter().position(|&b| b == 0).unwrap_or(0) + 1;
    }
    if flags & 0x10 != 0 {
        // FCOMMENT
        offset += gz[offset..].iter().position(|&b| b == 0).unwrap_or(0) + 1;
    }
    if flags & 0x02 != 0 {
        // FHCRC
        offset += 2;
    }
    if gz.len() < offset + 8 {
        return Err(DingError::Configuration(
            "truncated gzip stream".to_string(),
        ));
    }
    Ok(gz[offset..gz.len() - 8].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn strips_minimal_gzip_header_and_trailer() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let gz = encoder.finish().unwrap();

        let deflate = extract_deflate_payload(&gz).unwrap();
        let mut decoder = flate2::read::DeflateDecoder::new(deflate.as_slice());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn rejects_non_gzip_input() {
        assert!(extract_deflate_payload(b"not gzip at all").is_err());
    }
}
