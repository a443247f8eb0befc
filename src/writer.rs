//! Materializing response bodies on disk.
//!
//! URLs map to paths under the directory prefix through a restricted
//! filename policy. The session object carries one URL through the request
//! (adding `Range`/`If-Modified-Since` headers) and the response (writing,
//! appending, or skipping), so clobber and resume decisions stay in one
//! place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::debug;

use crate::urlnorm::UrlInfo;

const DEFAULT_INDEX: &str = "index.html";

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("cannot continue {0}: server ignored the Range request")]
    ContinueNotSupported(PathBuf),
}

pub type Result<T> = std::result::Result<T, WriterError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WriterError + '_ {
    move |source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Filename restriction modes, combinable (`--restrict-file-names`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestrictModes {
    pub ascii: bool,
    pub lowercase: bool,
    pub uppercase: bool,
    /// Strip control bytes instead of percent-encoding them.
    pub nocontrol: bool,
    pub unix: bool,
    pub windows: bool,
}

impl RestrictModes {
    pub fn parse(spec: &str) -> Option<Self> {
        let mut modes = Self::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "ascii" => modes.ascii = true,
                "lowercase" | "lower" => modes.lowercase = true,
                "uppercase" | "upper" => modes.uppercase = true,
                "nocontrol" => modes.nocontrol = true,
                "unix" => modes.unix = true,
                "windows" => modes.windows = true,
                _ => return None,
            }
        }
        Some(modes)
    }
}

/// Directory layout strategy (`--no-directories` and friends).
#[derive(Debug, Clone, Default)]
pub struct DirectoryPolicy {
    pub no_directories: bool,
    pub force_directories: bool,
    pub no_host_directories: bool,
    pub protocol_directories: bool,
    pub cut_dirs: u32,
}

/// Collision handling for existing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClobberMode {
    /// Overwrite whatever is there.
    #[default]
    Overwrite,
    /// Pick the first free `name.N`.
    NoClobber,
    /// Resume partial downloads with a Range request.
    Continue,
    /// Skip when the local copy is at least as new as the server's.
    Timestamping,
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub prefix: PathBuf,
    pub directories: DirectoryPolicy,
    pub restrict: RestrictModes,
    pub max_filename_length: usize,
    pub clobber: ClobberMode,
    /// Remove files after the pipeline finishes with them.
    pub delete_after: bool,
    /// `-O`: concatenate every body into this one file.
    pub output_document: Option<PathBuf>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("."),
            directories: DirectoryPolicy::default(),
            restrict: RestrictModes::default(),
            max_filename_length: 160,
            clobber: ClobberMode::Overwrite,
            delete_after: false,
            output_document: None,
        }
    }
}

/// Windows reserved device names, forbidden as file stems.
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

pub struct Writer {
    options: WriterOptions,
}

impl Writer {
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Compute the on-disk path for a URL, before collision handling.
    pub fn base_path(&self, url: &UrlInfo) -> PathBuf {
        if let Some(output) = &self.options.output_document {
            return output.clone();
        }

        let mut parts: Vec<String> = Vec::new();
        let dirs = &self.options.directories;

        let use_dirs = dirs.force_directories || !dirs.no_directories;
        if use_dirs {
            if dirs.protocol_directories {
                parts.push(self.clean_component(url.scheme()));
            }
            if !dirs.no_host_directories {
                let mut host = url.host().to_string();
                if url.as_url().port().is_some() {
                    host = format!("{}:{}", host, url.port());
                }
                parts.push(self.clean_component(&host));
            }

            let segments: Vec<&str> = url
                .path()
                .split('/')
                .filter(|s| !s.is_empty())
                .collect();
            // The final segment is the filename, not a directory.
            let dir_count = segments.len().saturating_sub(1);
            for segment in segments
                .iter()
                .take(dir_count)
                .skip(dirs.cut_dirs as usize)
            {
                parts.push(self.clean_component(segment));
            }
        }

        let mut filename = url
            .path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| self.clean_component(s))
            .unwrap_or_else(|| DEFAULT_INDEX.to_string());

        if let Some(query) = url.query() {
            filename = format!("{}?{}", filename, self.clean_component(query));
            filename = self.truncate_filename(&filename);
        }

        let mut path = self.options.prefix.clone();
        for part in parts {
            path.push(part);
        }
        path.push(filename);
        path
    }

    /// Apply the restriction modes to one path component and cap its length.
    ///
    /// The component arrives percent-encoded from the canonical URL; it is
    /// decoded first so the policy sees real characters, then re-encoded.
    fn clean_component(&self, component: &str) -> String {
        let modes = &self.options.restrict;

        // Dot segments cannot survive as literal path components.
        if component == "." {
            return "%2E".to_string();
        }
        if component == ".." {
            return "%2E%2E".to_string();
        }

        let decoded = percent_decode_str(component).decode_utf8_lossy();

        let mut out = String::with_capacity(decoded.len());
        for ch in decoded.chars() {
            let escape = match ch {
                c if (c as u32) < 0x20 => {
                    if modes.nocontrol {
                        continue;
                    }
                    true
                }
                '/' | '%' | '\0' => true,
                '<' | '>' | ':' | '"' | '\\' | '|' | '?' | '*' if modes.windows => true,
                c if !c.is_ascii() && modes.ascii => true,
                _ => false,
            };

            if escape {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            } else {
                out.push(ch);
            }
        }

        if modes.lowercase {
            out = out.to_lowercase();
        }
        if modes.uppercase {
            out = out.to_uppercase();
        }

        if modes.windows {
            let stem = out.split('.').next().unwrap_or("");
            if WINDOWS_RESERVED.contains(&stem.to_ascii_uppercase().as_str()) {
                out = format!("{out}_");
            }
        }

        self.truncate_filename(&out)
    }

    /// Cap a component at the length limit, keeping the extension.
    fn truncate_filename(&self, name: &str) -> String {
        let max = self.options.max_filename_length;
        if max == 0 || name.chars().count() <= max {
            return name.to_string();
        }

        match name.rfind('.') {
            Some(idx) if idx > 0 && name.len() - idx <= max => {
                let extension = &name[idx..];
                let keep = max - extension.chars().count();
                let stem: String = name.chars().take(keep).collect();
                format!("{stem}{extension}")
            }
            _ => name.chars().take(max).collect(),
        }
    }

    /// Resolve directory/file collisions against the real filesystem.
    ///
    /// A directory sitting where the file should go gets the file a `.f`
    /// suffix; a file sitting where a directory is needed renames that
    /// component with `.d`.
    fn resolve_collisions(&self, path: &Path) -> PathBuf {
        let mut resolved = PathBuf::new();
        let components: Vec<_> = path.components().collect();

        for (idx, component) in components.iter().enumerate() {
            let is_last = idx == components.len() - 1;
            resolved.push(component);

            if is_last {
                if resolved.is_dir() {
                    let name = format!(
                        "{}.f",
                        resolved.file_name().unwrap_or_default().to_string_lossy()
                    );
                    resolved.set_file_name(name);
                }
            } else if resolved.is_file() {
                let name = format!(
                    "{}.d",
                    resolved.file_name().unwrap_or_default().to_string_lossy()
                );
                resolved.set_file_name(name);
            }
        }

        resolved
    }

    /// Start a writer session for one URL.
    pub fn session(&self, url: &UrlInfo) -> WriterSession {
        let base = self.base_path(url);
        let path = self.resolve_collisions(&base);

        let path = match self.options.clobber {
            ClobberMode::NoClobber if self.options.output_document.is_none() => {
                anti_clobber(&path)
            }
            _ => path,
        };

        let existing = fs::metadata(&path).ok();

        WriterSession {
            path,
            clobber: self.options.clobber,
            delete_after: self.options.delete_after,
            append_output: self.options.output_document.is_some(),
            existing_len: existing.as_ref().map(|m| m.len()),
            existing_mtime: existing.and_then(|m| m.modified().ok()),
            resumed: false,
        }
    }
}

/// First free `name`, `name.1`, `name.2`, ...
fn anti_clobber(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    for suffix in 1u32.. {
        let candidate = PathBuf::from(format!("{}.{}", path.display(), suffix));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Decision for the response phase.
#[derive(Debug, PartialEq, Eq)]
pub enum SaveDecision {
    /// Write the body to the file.
    Save,
    /// Append the body (successful `--continue` resume).
    Append,
    /// Keep the local copy, discard the body.
    SkipLocalNewer,
    /// Server says not modified.
    SkipNotModified,
}

/// Carries one URL through request preparation and response saving.
pub struct WriterSession {
    path: PathBuf,
    clobber: ClobberMode,
    delete_after: bool,
    append_output: bool,
    existing_len: Option<u64>,
    existing_mtime: Option<SystemTime>,
    resumed: bool,
}

impl WriterSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extra request headers implied by the clobber mode.
    pub fn request_headers(&mut self) -> Vec<(String, String)> {
        let mut headers = Vec::new();

        match self.clobber {
            ClobberMode::Continue => {
                if let Some(len) = self.existing_len.filter(|len| *len > 0) {
                    headers.push(("Range".to_string(), format!("bytes={len}-")));
                    self.resumed = true;
                    debug!(path = %self.path.display(), offset = len, "resuming download");
                }
            }
            ClobberMode::Timestamping => {
                if let Some(mtime) = self.existing_mtime {
                    let datetime: DateTime<Utc> = mtime.into();
                    headers.push((
                        "If-Modified-Since".to_string(),
                        datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
                    ));
                }
            }
            _ => {}
        }

        headers
    }

    /// Classify the response before the body is consumed.
    pub fn decide(&self, status: u16, last_modified: Option<&str>) -> Result<SaveDecision> {
        if status == 304 {
            return Ok(SaveDecision::SkipNotModified);
        }

        if self.resumed {
            return match status {
                206 => Ok(SaveDecision::Append),
                // Server restarted from zero; rewrite the whole file.
                200 => Ok(SaveDecision::Save),
                _ => Err(WriterError::ContinueNotSupported(self.path.clone())),
            };
        }

        if self.clobber == ClobberMode::Timestamping {
            if let (Some(local), Some(remote)) = (
                self.existing_mtime,
                last_modified.and_then(parse_http_date),
            ) {
                let local: DateTime<Utc> = local.into();
                if local >= remote {
                    return Ok(SaveDecision::SkipLocalNewer);
                }
            }
        }

        Ok(SaveDecision::Save)
    }

    /// Open the destination for writing (or appending).
    pub fn open(&self, decision: &SaveDecision) -> Result<fs::File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        let mut opts = fs::OpenOptions::new();
        match decision {
            SaveDecision::Append => opts.append(true).create(true),
            _ if self.append_output => opts.append(true).create(true),
            _ => opts.write(true).create(true).truncate(true),
        };

        opts.open(&self.path).map_err(io_err(&self.path))
    }

    /// Final bookkeeping once the body is on disk.
    pub fn finish(&self, last_modified: Option<&str>) -> Result<u64> {
        if self.clobber == ClobberMode::Timestamping {
            if let Some(remote) = last_modified.and_then(parse_http_date) {
                let file = fs::File::options()
                    .write(true)
                    .open(&self.path)
                    .map_err(io_err(&self.path))?;
                let _ = file.set_modified(SystemTime::from(remote));
            }
        }

        let len = fs::metadata(&self.path).map_err(io_err(&self.path))?.len();

        if self.delete_after {
            debug!(path = %self.path.display(), "removing file (--delete-after)");
            fs::remove_file(&self.path).map_err(io_err(&self.path))?;
        }

        Ok(len)
    }

    /// Remove a partially-written file after a failed fetch.
    pub fn discard(&self) {
        if !self.resumed && !self.append_output && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn url(s: &str) -> UrlInfo {
        UrlInfo::parse(s).unwrap()
    }

    fn writer(prefix: &Path) -> Writer {
        Writer::new(WriterOptions {
            prefix: prefix.to_path_buf(),
            ..WriterOptions::default()
        })
    }

    #[test]
    fn test_basic_path_layout() {
        let writer = writer(Path::new("out"));
        assert_eq!(
            writer.base_path(&url("http://h.example/a/b.txt")),
            PathBuf::from("out/h.example/a/b.txt")
        );
        assert_eq!(
            writer.base_path(&url("http://h.example/")),
            PathBuf::from("out/h.example/index.html")
        );
        assert_eq!(
            writer.base_path(&url("http://h.example/dir/")),
            PathBuf::from("out/h.example/dir/index.html")
        );
    }

    #[test]
    fn test_no_host_and_cut_dirs() {
        let writer = Writer::new(WriterOptions {
            prefix: PathBuf::from("out"),
            directories: DirectoryPolicy {
                no_host_directories: true,
                cut_dirs: 1,
                ..DirectoryPolicy::default()
            },
            ..WriterOptions::default()
        });
        assert_eq!(
            writer.base_path(&url("http://h/a/b/c.txt")),
            PathBuf::from("out/b/c.txt")
        );
    }

    #[test]
    fn test_protocol_directories() {
        let writer = Writer::new(WriterOptions {
            prefix: PathBuf::from("out"),
            directories: DirectoryPolicy {
                protocol_directories: true,
                ..DirectoryPolicy::default()
            },
            ..WriterOptions::default()
        });
        assert_eq!(
            writer.base_path(&url("https://h/x")),
            PathBuf::from("out/https/h/x")
        );
    }

    #[test]
    fn test_force_directories_overrides_no_directories() {
        let writer = Writer::new(WriterOptions {
            prefix: PathBuf::from("out"),
            directories: DirectoryPolicy {
                no_directories: true,
                force_directories: true,
                ..DirectoryPolicy::default()
            },
            ..WriterOptions::default()
        });
        assert_eq!(
            writer.base_path(&url("http://h/a/b.txt")),
            PathBuf::from("out/h/a/b.txt")
        );
    }

    #[test]
    fn test_no_directories() {
        let writer = Writer::new(WriterOptions {
            prefix: PathBuf::from("out"),
            directories: DirectoryPolicy {
                no_directories: true,
                ..DirectoryPolicy::default()
            },
            ..WriterOptions::default()
        });
        assert_eq!(
            writer.base_path(&url("http://h/a/b/c.txt")),
            PathBuf::from("out/c.txt")
        );
    }

    #[test]
    fn test_windows_restrictions() {
        let writer = Writer::new(WriterOptions {
            restrict: RestrictModes {
                windows: true,
                ..RestrictModes::default()
            },
            ..WriterOptions::default()
        });
        let path = writer.base_path(&url("http://h/what%3Fis.txt"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains('?'));
        assert!(!name.contains(':'));

        let path = writer.base_path(&url("http://h/CON.txt"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("CON"));
        assert_ne!(name, "CON.txt");
    }

    #[test]
    fn test_lowercase_mode() {
        let writer = Writer::new(WriterOptions {
            restrict: RestrictModes {
                lowercase: true,
                ..RestrictModes::default()
            },
            ..WriterOptions::default()
        });
        assert_eq!(
            writer.base_path(&url("http://h/DIR/FILE.TXT")),
            PathBuf::from("./h/dir/file.txt")
        );
    }

    #[test]
    fn test_filename_truncation_keeps_extension() {
        let writer = Writer::new(WriterOptions {
            max_filename_length: 20,
            ..WriterOptions::default()
        });
        let long = "a".repeat(100);
        let path = writer.base_path(&url(&format!("http://h/{long}.html")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 20);
        assert!(name.ends_with(".html"));
    }

    #[test]
    fn test_directory_collision_gets_f_suffix() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("h/docs")).unwrap();

        let writer = writer(dir.path());
        let session = writer.session(&url("http://h/docs"));
        assert!(session
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("docs.f"));
    }

    #[test]
    fn test_file_collision_gets_d_suffix() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("h")).unwrap();
        fs::write(dir.path().join("h/docs"), b"file").unwrap();

        let writer = writer(dir.path());
        let session = writer.session(&url("http://h/docs/page.html"));
        let rendered = session.path().to_string_lossy().into_owned();
        assert!(rendered.contains("docs.d"));
    }

    #[test]
    fn test_anti_clobber_numbering() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("h")).unwrap();
        fs::write(dir.path().join("h/a.txt"), b"old").unwrap();

        let writer = Writer::new(WriterOptions {
            prefix: dir.path().to_path_buf(),
            clobber: ClobberMode::NoClobber,
            ..WriterOptions::default()
        });
        let session = writer.session(&url("http://h/a.txt"));
        assert!(session.path().to_string_lossy().ends_with("a.txt.1"));
    }

    #[test]
    fn test_continue_sends_range_and_appends() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("h")).unwrap();
        fs::write(dir.path().join("h/a.bin"), b"12345").unwrap();

        let writer = Writer::new(WriterOptions {
            prefix: dir.path().to_path_buf(),
            clobber: ClobberMode::Continue,
            ..WriterOptions::default()
        });
        let mut session = writer.session(&url("http://h/a.bin"));
        let headers = session.request_headers();
        assert_eq!(
            headers,
            vec![("Range".to_string(), "bytes=5-".to_string())]
        );

        assert_eq!(session.decide(206, None).unwrap(), SaveDecision::Append);
        assert!(session.decide(416, None).is_err());
    }

    #[test]
    fn test_timestamping_skips_when_local_newer() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("h")).unwrap();
        fs::write(dir.path().join("h/a.txt"), b"local").unwrap();

        let writer = Writer::new(WriterOptions {
            prefix: dir.path().to_path_buf(),
            clobber: ClobberMode::Timestamping,
            ..WriterOptions::default()
        });
        let mut session = writer.session(&url("http://h/a.txt"));

        let headers = session.request_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "If-Modified-Since");

        // Server copy much older than the file just written.
        let decision = session
            .decide(200, Some("Mon, 01 Jan 1990 00:00:00 +0000"))
            .unwrap();
        assert_eq!(decision, SaveDecision::SkipLocalNewer);
    }

    #[test]
    fn test_save_and_finish() {
        let dir = tempdir().unwrap();
        let writer = writer(dir.path());
        let session = writer.session(&url("http://h/a/b.txt"));

        let decision = session.decide(200, None).unwrap();
        let mut file = session.open(&decision).unwrap();
        io::Write::write_all(&mut file, b"abc").unwrap();
        drop(file);

        assert_eq!(session.finish(None).unwrap(), 3);
        assert_eq!(fs::read(session.path()).unwrap(), b"abc");
    }
}
