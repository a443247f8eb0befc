//! WARC 1.0 recording.
//!
//! The recorder owns the output file exclusively. Appends are serialized and
//! guarded by a journal: before each record the current offset is written to
//! `<file>.journal`; a failed append truncates back to it, so a crash always
//! leaves a parseable sequence of complete records (and, when compressing,
//! complete gzip members — each record is its own member so readers can seek
//! by record).

mod cdx;
mod record;

pub use cdx::{CdxMeta, CdxWriter};
pub use record::{
    BlockSpool, WarcRecord, CONTENT_TYPE_HTTP_REQUEST, CONTENT_TYPE_HTTP_RESPONSE,
    CONTENT_TYPE_WARC_FIELDS, REVISIT_PROFILE, TYPE_METADATA, TYPE_REQUEST, TYPE_RESOURCE,
    TYPE_RESPONSE, TYPE_REVISIT, TYPE_WARCINFO,
};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frontier::Frontier;

#[derive(Debug, Error)]
pub enum WarcError {
    #[error("WARC I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("refusing to append to {0}: stale journal from an interrupted run")]
    StaleJournal(PathBuf),

    #[error("frontier error: {0}")]
    Frontier(#[from] crate::frontier::FrontierError),
}

pub type Result<T> = std::result::Result<T, WarcError>;

/// Recorder configuration, mirroring the `--warc-*` flag family.
#[derive(Debug, Clone)]
pub struct WarcOptions {
    /// Output prefix; files are `<prefix>.warc[.gz]` or numbered when
    /// `max_size` is set.
    pub prefix: PathBuf,
    pub compress: bool,
    pub digests: bool,
    pub appending: bool,
    pub cdx: bool,
    pub dedup: bool,
    pub max_size: Option<u64>,
    pub move_to: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    /// Extra warcinfo fields from `--warc-header`.
    pub extra_fields: Vec<(String, String)>,
    pub software: String,
    /// Capture the crawl log into a final `resource` record.
    pub log: bool,
}

impl Default for WarcOptions {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("crawl"),
            compress: true,
            digests: true,
            appending: false,
            cdx: false,
            dedup: false,
            max_size: None,
            move_to: None,
            temp_dir: None,
            extra_fields: Vec::new(),
            software: format!("webarc/{}", env!("CARGO_PKG_VERSION")),
            log: true,
        }
    }
}

/// Shared buffer the tracing layer writes into for the WARC log record.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self) -> Vec<u8> {
        self.0
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut inner) = self.0.lock() {
            inner.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct Inner {
    warc_path: PathBuf,
    warcinfo_id: String,
    sequence: u32,
    cdx: Option<CdxWriter>,
}

/// Append-only WARC writer with journaling and rotation.
pub struct WarcRecorder {
    options: WarcOptions,
    inner: Mutex<Inner>,
    log_buffer: Option<LogBuffer>,
}

impl WarcRecorder {
    /// Open the first output file and write its warcinfo record.
    pub fn new(options: WarcOptions, log_buffer: Option<LogBuffer>) -> Result<Self> {
        let mut inner = Inner {
            warc_path: PathBuf::new(),
            warcinfo_id: String::new(),
            sequence: 0,
            cdx: None,
        };

        let recorder = Self {
            options,
            inner: Mutex::new(inner_placeholder()),
            log_buffer,
        };

        recorder.start_file(&mut inner, false)?;

        if recorder.options.cdx {
            let cdx_path = recorder.options.prefix.with_extension("cdx");
            inner.cdx = Some(CdxWriter::open(&cdx_path, recorder.options.appending)?);
        }

        *recorder.inner.lock().expect("recorder poisoned") = inner;
        Ok(recorder)
    }

    fn file_name(&self, sequence: u32, meta: bool) -> PathBuf {
        let extension = if self.options.compress { "warc.gz" } else { "warc" };
        let stem = self.options.prefix.as_os_str().to_string_lossy();

        let name = if self.options.max_size.is_none() {
            format!("{stem}.{extension}")
        } else if meta {
            format!("{stem}-meta.{extension}")
        } else {
            format!("{stem}-{sequence:05}.{extension}")
        };
        PathBuf::from(name)
    }

    fn journal_path(warc_path: &Path) -> PathBuf {
        let mut name = warc_path.as_os_str().to_os_string();
        name.push(".journal");
        PathBuf::from(name)
    }

    /// Open a fresh (or appended) file and emit its warcinfo record.
    fn start_file(&self, inner: &mut Inner, meta: bool) -> Result<()> {
        let mut path = self.file_name(inner.sequence, meta);

        if self.options.appending {
            // A stale journal marks a file whose tail may be torn; never
            // append after it. Step past it to the next number instead.
            while Self::journal_path(&path).exists() {
                if self.options.max_size.is_none() {
                    return Err(WarcError::StaleJournal(path));
                }
                warn!(file = %path.display(), "stale journal, rotating past file");
                inner.sequence += 1;
                path = self.file_name(inner.sequence, meta);
            }
        } else {
            // Truncate any previous content.
            File::create(&path)?;
            let journal = Self::journal_path(&path);
            if journal.exists() {
                fs::remove_file(&journal)?;
            }
        }

        debug!(file = %path.display(), "WARC output file");
        inner.warc_path = path;

        let mut warcinfo = WarcRecord::new(TYPE_WARCINFO, CONTENT_TYPE_WARC_FIELDS);
        warcinfo.set_field(
            "WARC-Filename",
            &inner
                .warc_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        let mut body = String::new();
        body.push_str(&format!("software: {}\r\n", self.options.software));
        body.push_str("format: WARC File Format 1.0\r\n");
        body.push_str(
            "conformsTo: http://bibnum.bnf.fr/WARC/WARC_ISO_28500_version1_latestdraft.pdf\r\n",
        );
        for (name, value) in &self.options.extra_fields {
            body.push_str(&format!("{name}: {value}\r\n"));
        }
        warcinfo.block = BlockSpool::from_bytes(body.into_bytes());
        warcinfo.finalize(None, self.options.digests)?;

        inner.warcinfo_id = warcinfo.record_id().to_string();
        self.append(inner, &mut warcinfo, None)?;
        Ok(())
    }

    /// Append one record under journal protection.
    fn append(
        &self,
        inner: &mut Inner,
        record: &mut WarcRecord,
        cdx_meta: Option<&CdxMeta>,
    ) -> Result<()> {
        if !inner.warcinfo_id.is_empty() {
            record.set_field("WARC-Warcinfo-ID", &inner.warcinfo_id);
        }

        let before_offset = fs::metadata(&inner.warc_path).map(|m| m.len()).unwrap_or(0);
        let journal_path = Self::journal_path(&inner.warc_path);
        fs::write(&journal_path, before_offset.to_string())?;

        let write_result: io::Result<()> = (|| {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&inner.warc_path)?;

            if self.options.compress {
                let mut encoder = GzEncoder::new(&mut file, Compression::default());
                record.write_to(&mut encoder)?;
                encoder.finish()?;
            } else {
                record.write_to(&mut file)?;
            }
            file.sync_data()?;
            Ok(())
        })();

        if let Err(error) = write_result {
            warn!(
                file = %inner.warc_path.display(),
                offset = before_offset,
                "append failed, truncating to journaled offset"
            );
            let truncate_result = OpenOptions::new()
                .write(true)
                .open(&inner.warc_path)
                .and_then(|file| file.set_len(before_offset));
            if let Err(truncate_error) = truncate_result {
                warn!(error = %truncate_error, "truncate after failed append also failed");
            }
            return Err(error.into());
        }

        let after_offset = fs::metadata(&inner.warc_path)?.len();
        fs::write(&journal_path, after_offset.to_string())?;

        if let (Some(cdx), Some(meta)) = (&inner.cdx, cdx_meta) {
            let filename = inner
                .warc_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            cdx.write_entry(meta, after_offset - before_offset, before_offset, &filename)?;
        }

        Ok(())
    }

    /// Write a record pair-independent record (warcinfo is internal; this is
    /// for metadata/resource records built by sessions).
    fn write_record(&self, record: &mut WarcRecord, cdx_meta: Option<&CdxMeta>) -> Result<()> {
        let mut inner = self.inner.lock().expect("recorder poisoned");
        self.append(&mut inner, record, cdx_meta)
    }

    /// Rotate to the next numbered file when the current one is over the
    /// size threshold. Called between exchanges so request/response pairs
    /// stay in one file.
    pub fn maybe_rotate(&self) -> Result<()> {
        let Some(max_size) = self.options.max_size else {
            return Ok(());
        };

        let mut inner = self.inner.lock().expect("recorder poisoned");
        let size = fs::metadata(&inner.warc_path).map(|m| m.len()).unwrap_or(0);
        if size < max_size {
            return Ok(());
        }

        info!(file = %inner.warc_path.display(), size, "rotating WARC file");
        self.finish_current(&mut inner)?;
        inner.sequence += 1;
        self.start_file(&mut inner, false)?;
        Ok(())
    }

    fn finish_current(&self, inner: &mut Inner) -> Result<()> {
        let journal = Self::journal_path(&inner.warc_path);
        if journal.exists() {
            fs::remove_file(&journal)?;
        }
        if let Some(move_to) = &self.options.move_to {
            move_into(&inner.warc_path, move_to)?;
        }
        Ok(())
    }

    /// Flush the crawl log, close the current file, delete the journal.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("recorder poisoned");

        if self.options.log {
            if let Some(buffer) = &self.log_buffer {
                let log_bytes = buffer.take();
                if !log_bytes.is_empty() {
                    if self.options.max_size.is_some() {
                        self.finish_current(&mut inner)?;
                        self.start_file(&mut inner, true)?;
                    }

                    let mut record = WarcRecord::new(TYPE_RESOURCE, "text/plain");
                    record.set_field("WARC-Target-URI", "urn:webarc:log");
                    record.block = BlockSpool::from_bytes(log_bytes);
                    record.finalize(None, self.options.digests)?;
                    self.append(&mut inner, &mut record, None)?;
                }
            }
        }

        self.finish_current(&mut inner)?;

        if let (Some(cdx), Some(move_to)) = (&inner.cdx, &self.options.move_to) {
            move_into(cdx.path(), move_to)?;
        }

        Ok(())
    }

    /// Start recording one HTTP exchange.
    pub fn session(self: &Arc<Self>) -> WarcSession {
        WarcSession {
            recorder: Arc::clone(self),
            request_id: None,
            response: None,
            response_payload_offset: 0,
            target_uri: String::new(),
            ip: None,
        }
    }

    pub fn current_path(&self) -> PathBuf {
        self.inner
            .lock()
            .map(|inner| inner.warc_path.clone())
            .unwrap_or_default()
    }

    fn temp_dir(&self) -> Option<&Path> {
        self.options.temp_dir.as_deref()
    }
}

fn inner_placeholder() -> Inner {
    Inner {
        warc_path: PathBuf::new(),
        warcinfo_id: String::new(),
        sequence: 0,
        cdx: None,
    }
}

fn move_into(path: &Path, dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "--warc-move target is not a directory");
        return Ok(());
    }
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }
    let dest = dir.join(name);
    fs::rename(path, &dest).or_else(|_| {
        // Cross-device fallback.
        fs::copy(path, &dest).and_then(|_| fs::remove_file(path))
    })?;
    debug!(from = %path.display(), to = %dest.display(), "moved archive file");
    Ok(())
}

/// Records one request/response exchange (one redirect hop is one exchange).
pub struct WarcSession {
    recorder: Arc<WarcRecorder>,
    request_id: Option<String>,
    response: Option<WarcRecord>,
    response_payload_offset: u64,
    target_uri: String,
    ip: Option<IpAddr>,
}

impl WarcSession {
    /// Record the request as sent: reconstructed header block plus body.
    pub fn record_request(
        &mut self,
        url: &str,
        ip: Option<IpAddr>,
        header_block: &[u8],
        body: &[u8],
    ) -> Result<()> {
        self.target_uri = url.to_string();
        self.ip = ip;

        let mut record = WarcRecord::new(TYPE_REQUEST, CONTENT_TYPE_HTTP_REQUEST);
        record.set_field("WARC-Target-URI", url);
        if let Some(ip) = ip {
            record.set_field("WARC-IP-Address", &ip.to_string());
        }

        let mut block = BlockSpool::new(self.recorder.temp_dir());
        block.write(header_block)?;
        block.write(body)?;
        record.block = block;
        record.finalize(Some(header_block.len() as u64), self.recorder.options.digests)?;

        self.request_id = Some(record.record_id().to_string());
        self.recorder.write_record(&mut record, None)?;
        Ok(())
    }

    /// Begin the response record with its reconstructed header block.
    pub fn begin_response(&mut self, header_block: &[u8]) -> Result<()> {
        let mut record = WarcRecord::new(TYPE_RESPONSE, CONTENT_TYPE_HTTP_RESPONSE);
        record.set_field("WARC-Target-URI", &self.target_uri);
        if let Some(ip) = self.ip {
            record.set_field("WARC-IP-Address", &ip.to_string());
        }
        if let Some(request_id) = &self.request_id {
            record.set_field("WARC-Concurrent-To", request_id);
        }

        let mut block = BlockSpool::new(self.recorder.temp_dir());
        block.write(header_block)?;
        self.response_payload_offset = header_block.len() as u64;
        record.block = block;
        self.response = Some(record);
        Ok(())
    }

    /// Append a chunk of the response body.
    pub fn response_data(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(record) = self.response.as_mut() {
            record.block.write(chunk)?;
        }
        Ok(())
    }

    /// Finish the response record. With dedup enabled and a frontier hit,
    /// the record is rewritten as a `revisit` referring to the original.
    ///
    /// Returns the stored payload digest, if digests are on.
    pub fn end_response(
        &mut self,
        frontier: Option<&Frontier>,
        cdx_meta: Option<CdxMeta>,
    ) -> Result<Option<String>> {
        let Some(mut record) = self.response.take() else {
            return Ok(None);
        };

        record.finalize(Some(self.response_payload_offset), self.recorder.options.digests)?;
        let payload_digest = record.field("WARC-Payload-Digest").map(|s| s.to_string());

        let mut is_revisit = false;
        if self.recorder.options.dedup {
            if let (Some(frontier), Some(digest)) = (frontier, payload_digest.as_deref()) {
                if let Some(original_id) = frontier.get_revisit_id(&self.target_uri, digest)? {
                    debug!(url = %self.target_uri, "duplicate payload, writing revisit record");
                    record.block.truncate(self.response_payload_offset)?;
                    record.finalize(None, self.recorder.options.digests)?;
                    record.set_field("WARC-Type", TYPE_REVISIT);
                    record.set_field("WARC-Refers-To", &original_id);
                    record.set_field("WARC-Profile", REVISIT_PROFILE);
                    record.set_field("WARC-Truncated", "length");
                    // The payload digest still names the full payload.
                    if let Some(digest) = &payload_digest {
                        record.set_field("WARC-Payload-Digest", digest);
                    }
                    is_revisit = true;
                }
            }
        }

        let cdx_meta = if is_revisit {
            None
        } else {
            cdx_meta.map(|mut meta| {
                meta.payload_digest = payload_digest.clone();
                meta
            })
        };

        self.recorder.write_record(&mut record, cdx_meta.as_ref())?;

        if self.recorder.options.dedup && !is_revisit {
            if let (Some(frontier), Some(digest)) = (frontier, payload_digest.as_deref()) {
                frontier.add_visit(&self.target_uri, digest, record.record_id())?;
            }
        }

        Ok(payload_digest)
    }

    /// The exchange failed before response headers arrived: describe the
    /// error in a `metadata` record so the archive still accounts for it.
    pub fn record_failure(&mut self, url: &str, error: &str) -> Result<()> {
        self.response = None;

        let mut record = WarcRecord::new(TYPE_METADATA, "text/plain");
        record.set_field("WARC-Target-URI", url);
        if let Some(request_id) = &self.request_id {
            record.set_field("WARC-Concurrent-To", request_id);
        }

        record.block = BlockSpool::from_bytes(format!("fetch error: {error}\r\n").into_bytes());
        record.finalize(None, self.recorder.options.digests)?;
        self.recorder.write_record(&mut record, None)?;
        Ok(())
    }
}
