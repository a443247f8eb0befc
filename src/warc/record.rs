//! WARC record envelope and serialization.
//!
//! A record is a CRLF header block, a blank line, the payload block, and a
//! trailing `\r\n\r\n`. Field order is preserved as written. Block and
//! payload digests are SHA-1, rendered `sha1:<BASE32>` as archive tooling
//! expects.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Utc;
use data_encoding::BASE32;
use sha1::{Digest, Sha1};
use uuid::Uuid;

pub const WARC_VERSION: &str = "WARC/1.0";

pub const TYPE_WARCINFO: &str = "warcinfo";
pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_REVISIT: &str = "revisit";
pub const TYPE_RESOURCE: &str = "resource";
pub const TYPE_METADATA: &str = "metadata";

pub const CONTENT_TYPE_WARC_FIELDS: &str = "application/warc-fields";
pub const CONTENT_TYPE_HTTP_REQUEST: &str = "application/http;msgtype=request";
pub const CONTENT_TYPE_HTTP_RESPONSE: &str = "application/http;msgtype=response";

/// Profile URI for identical-payload-digest revisit records.
pub const REVISIT_PROFILE: &str =
    "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest";

const SPOOL_THRESHOLD: usize = 256 * 1024;
const CHUNK: usize = 8192;

/// Record payload block, kept in memory up to a threshold and spooled to a
/// temporary file beyond it so large bodies never need to fit in memory.
pub struct BlockSpool {
    memory: Vec<u8>,
    file: Option<File>,
    len: u64,
    temp_dir: Option<std::path::PathBuf>,
}

impl BlockSpool {
    pub fn new(temp_dir: Option<&Path>) -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            len: 0,
            temp_dir: temp_dir.map(|p| p.to_path_buf()),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            memory: bytes,
            file: None,
            len,
            temp_dir: None,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
        } else if self.memory.len() + data.len() > SPOOL_THRESHOLD {
            let mut file = match &self.temp_dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            file.write_all(&self.memory)?;
            file.write_all(data)?;
            self.memory = Vec::new();
            self.file = Some(file);
        } else {
            self.memory.extend_from_slice(data);
        }
        self.len += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop everything past `len` (used when a response record becomes a
    /// revisit and only the HTTP header block is kept).
    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        if len >= self.len {
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            file.set_len(len)?;
        } else {
            self.memory.truncate(len as usize);
        }
        self.len = len;
        Ok(())
    }

    /// Stream the block through `f` in chunks, from the start.
    pub fn read_chunks(&mut self, mut f: impl FnMut(&[u8]) -> io::Result<()>) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
            let mut buf = [0u8; CHUNK];
            loop {
                let count = file.read(&mut buf)?;
                if count == 0 {
                    break;
                }
                f(&buf[..count])?;
            }
            Ok(())
        } else {
            for chunk in self.memory.chunks(CHUNK) {
                f(chunk)?;
            }
            Ok(())
        }
    }
}

/// One WARC record: ordered header fields plus a payload block.
pub struct WarcRecord {
    fields: Vec<(String, String)>,
    pub block: BlockSpool,
}

impl WarcRecord {
    /// Create a record with the required common fields filled in.
    pub fn new(warc_type: &str, content_type: &str) -> Self {
        let mut record = Self {
            fields: Vec::new(),
            block: BlockSpool::from_bytes(Vec::new()),
        };
        record.set_field("WARC-Type", warc_type);
        record.set_field("Content-Type", content_type);
        record.set_field("WARC-Date", &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        record.set_field("WARC-Record-ID", &format!("<{}>", Uuid::new_v4().urn()));
        record
    }

    pub fn set_field(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            self.fields.push((name.to_string(), value.to_string()));
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn record_id(&self) -> &str {
        self.field("WARC-Record-ID").unwrap_or("")
    }

    pub fn warc_type(&self) -> &str {
        self.field("WARC-Type").unwrap_or("")
    }

    /// Set Content-Length and, when `digests` is on, the block digest plus a
    /// payload digest over everything past `payload_offset`.
    pub fn finalize(&mut self, payload_offset: Option<u64>, digests: bool) -> io::Result<()> {
        self.set_field("Content-Length", &self.block.len().to_string());

        if !digests {
            return Ok(());
        }

        let mut block_hasher = Sha1::new();
        let mut payload_hasher = Sha1::new();
        let mut position = 0u64;

        self.block.read_chunks(|chunk| {
            block_hasher.update(chunk);
            if let Some(offset) = payload_offset {
                let chunk_start = position;
                let chunk_end = position + chunk.len() as u64;
                if chunk_end > offset {
                    let skip = offset.saturating_sub(chunk_start) as usize;
                    payload_hasher.update(&chunk[skip..]);
                }
            }
            position += chunk.len() as u64;
            Ok(())
        })?;

        self.set_field(
            "WARC-Block-Digest",
            &format!("sha1:{}", BASE32.encode(&block_hasher.finalize())),
        );

        if payload_offset.is_some() {
            self.set_field(
                "WARC-Payload-Digest",
                &format!("sha1:{}", BASE32.encode(&payload_hasher.finalize())),
            );
        }

        Ok(())
    }

    /// Serialize the record to a writer.
    pub fn write_to(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(WARC_VERSION.as_bytes())?;
        out.write_all(b"\r\n")?;
        for (name, value) in &self.fields {
            out.write_all(name.as_bytes())?;
            out.write_all(b": ")?;
            out.write_all(value.as_bytes())?;
            out.write_all(b"\r\n")?;
        }
        out.write_all(b"\r\n")?;
        self.block.read_chunks(|chunk| out.write_all(chunk))?;
        out.write_all(b"\r\n\r\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_fields() {
        let record = WarcRecord::new(TYPE_RESPONSE, CONTENT_TYPE_HTTP_RESPONSE);
        assert_eq!(record.warc_type(), TYPE_RESPONSE);
        assert!(record.record_id().starts_with("<urn:uuid:"));
        assert!(record.field("WARC-Date").unwrap().ends_with('Z'));
    }

    #[test]
    fn test_serialization_layout() {
        let mut record = WarcRecord::new(TYPE_RESOURCE, "text/plain");
        record.block = BlockSpool::from_bytes(b"hello".to_vec());
        record.finalize(None, false).unwrap();

        let mut out = Vec::new();
        record.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("WARC/1.0\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("\r\n\r\nhello\r\n\r\n"));
    }

    #[test]
    fn test_digests_known_value() {
        let mut record = WarcRecord::new(TYPE_RESOURCE, "text/plain");
        record.block = BlockSpool::from_bytes(b"abc".to_vec());
        record.finalize(None, true).unwrap();

        // sha1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(
            record.field("WARC-Block-Digest").unwrap(),
            "sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5"
        );
        assert!(record.field("WARC-Payload-Digest").is_none());
    }

    #[test]
    fn test_payload_digest_skips_header() {
        let header = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut with_header = header.to_vec();
        with_header.extend_from_slice(b"abc");

        let mut record = WarcRecord::new(TYPE_RESPONSE, CONTENT_TYPE_HTTP_RESPONSE);
        record.block = BlockSpool::from_bytes(with_header);
        record.finalize(Some(header.len() as u64), true).unwrap();

        // Payload digest covers only "abc".
        assert_eq!(
            record.field("WARC-Payload-Digest").unwrap(),
            "sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5"
        );
        assert_ne!(
            record.field("WARC-Block-Digest").unwrap(),
            record.field("WARC-Payload-Digest").unwrap()
        );
    }

    #[test]
    fn test_spool_spills_to_file() {
        let mut spool = BlockSpool::new(None);
        let data = vec![0xAB; SPOOL_THRESHOLD + 1];
        spool.write(&data).unwrap();
        assert_eq!(spool.len(), data.len() as u64);

        let mut total = 0;
        spool
            .read_chunks(|chunk| {
                assert!(chunk.iter().all(|b| *b == 0xAB));
                total += chunk.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_spool_truncate() {
        let mut spool = BlockSpool::from_bytes(b"0123456789".to_vec());
        spool.truncate(4).unwrap();
        assert_eq!(spool.len(), 4);

        let mut collected = Vec::new();
        spool
            .read_chunks(|chunk| {
                collected.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(collected, b"0123");
    }
}
