//! Response body storage.
//!
//! Bodies stream into a spool that holds small payloads in memory and spills
//! large ones to a temporary file, so nothing in the pipeline ever needs the
//! whole body resident. The temp file lives as long as the [`Body`] handle.

use std::io::{self, Write};
use std::path::Path;

use crate::warc::BlockSpool;

/// A fully-received response body.
pub struct Body {
    spool: BlockSpool,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            spool: BlockSpool::from_bytes(Vec::new()),
        }
    }

    pub fn sink(temp_dir: Option<&Path>) -> BodySink {
        BodySink {
            spool: BlockSpool::new(temp_dir),
        }
    }

    pub fn len(&self) -> u64 {
        self.spool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spool.is_empty()
    }

    /// Copy the body into a writer, returning the byte count.
    pub fn copy_to(&mut self, out: &mut dyn Write) -> io::Result<u64> {
        let mut written = 0u64;
        self.spool.read_chunks(|chunk| {
            out.write_all(chunk)?;
            written += chunk.len() as u64;
            Ok(())
        })?;
        Ok(written)
    }

    /// Read the whole body into memory, for parsers that need it complete.
    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.spool.read_chunks(|chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(out)
    }
}

/// Write side of a body being received.
pub struct BodySink {
    spool: BlockSpool,
}

impl BodySink {
    pub fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.spool.write(chunk)
    }

    pub fn len(&self) -> u64 {
        self.spool.len()
    }

    pub fn finish(self) -> Body {
        Body { spool: self.spool }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut sink = Body::sink(None);
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        let mut body = sink.finish();

        assert_eq!(body.len(), 11);
        assert_eq!(body.to_vec().unwrap(), b"hello world");

        let mut out = Vec::new();
        assert_eq!(body.copy_to(&mut out).unwrap(), 11);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_large_body_spills() {
        let mut sink = Body::sink(None);
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..8 {
            sink.write(&chunk).unwrap();
        }
        let mut body = sink.finish();
        assert_eq!(body.len(), 512 * 1024);
        assert_eq!(body.to_vec().unwrap().len(), 512 * 1024);
    }
}
