//! Compression codecs for dump files.
//!
//! A dump is plain SQL text, optionally wrapped in gzip, xz or zstd. Codecs
//! come in two flavours behind the [`Codec`] trait: in-process encoders from
//! `flate2`/`zstd`, and [`ProcessCodec`], which pipes through the `gzip`,
//! `xz` or `zstd` binaries. xz has no in-process implementation here and is
//! always handled by the external binary.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use crate::error::{BackupError, Result};

/// Default compression level for in-process encoders.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Magic prefix of PostgreSQL custom-format archives (`pg_dump -Fc`).
pub const POSTGRES_ARCHIVE_MAGIC: &[u8] = b"PGDMP";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Compression applied to a dump file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "xz")]
    Xz,
    #[serde(rename = "zstd")]
    Zstd,
}

impl Compression {
    /// File suffix appended after `.sql`
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Xz => ".xz",
            Compression::Zstd => ".zst",
        }
    }

    /// Name as stored in metadata.json
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Parses a compression name, accepting common aliases.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "xz" => Ok(Compression::Xz),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(BackupError::InvalidOptions(format!(
                "Unknown compression '{}' (expected gzip, xz, zstd or none)",
                other
            ))),
        }
    }

    /// Infers compression from a filename suffix (`dump.sql.xz` -> xz).
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if name.ends_with(".gz") || name.ends_with(".gzip") {
            Compression::Gzip
        } else if name.ends_with(".xz") {
            Compression::Xz
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// Recognises compressed streams by their leading bytes.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else if header.starts_with(XZ_MAGIC) {
            Some(Compression::Xz)
        } else if header.starts_with(ZSTD_MAGIC) {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    /// Name of the external binary implementing this codec
    pub fn program(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gzip"),
            Compression::Xz => Some("xz"),
            Compression::Zstd => Some("zstd"),
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != Compression::None
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// How a dump file must be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// SQL text, tokenized and executed statement by statement
    PlainSql,
    /// Opaque PostgreSQL archive, handed to an external restore tool
    PostgresArchive,
}

/// Outcome of [`detect_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedFormat {
    pub compression: Compression,
    pub format: DumpFormat,
}

/// Decides how to read a dump file.
///
/// Precedence: explicit codec, then archive magic bytes, then filename
/// suffix, then compression magic bytes, then uncompressed SQL.
pub fn detect_format(path: &Path, explicit: Option<Compression>) -> Result<DetectedFormat> {
    if let Some(compression) = explicit {
        return Ok(DetectedFormat {
            compression,
            format: DumpFormat::PlainSql,
        });
    }

    let header = read_header(path, 8)?;
    if header.starts_with(POSTGRES_ARCHIVE_MAGIC) {
        return Ok(DetectedFormat {
            compression: Compression::None,
            format: DumpFormat::PostgresArchive,
        });
    }

    let compression = match Compression::from_path(path) {
        Compression::None => Compression::sniff(&header).unwrap_or(Compression::None),
        by_name => by_name,
    };

    Ok(DetectedFormat {
        compression,
        format: DumpFormat::PlainSql,
    })
}

fn read_header(path: &Path, len: usize) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| BackupError::io(path.display(), e))?;
    let mut header = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut header)
        .map_err(|e| BackupError::io(path.display(), e))?;
    Ok(header)
}

/// Write side of a codec. `finish` must be called to flush trailers and,
/// for external codecs, to reap the child process.
pub trait EncodeWriter: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// A compression strategy.
pub trait Codec: Send + Sync {
    fn compression(&self) -> Compression;

    /// Wrap a file so reads yield decompressed bytes.
    fn open_reader(&self, file: File) -> Result<Box<dyn Read + Send>>;

    /// Wrap a file so writes are compressed into it.
    fn create_writer(&self, file: File) -> Result<Box<dyn EncodeWriter>>;
}

/// Selects a codec for `compression`.
///
/// `prefer_external` pipes gzip and zstd through their binaries, matching the
/// output of the command-line tools byte for byte. xz always uses the binary.
pub fn codec_for(compression: Compression, prefer_external: bool) -> Result<Box<dyn Codec>> {
    match compression {
        Compression::None => Ok(Box::new(InProcessCodec::new(compression))),
        Compression::Xz => Ok(Box::new(ProcessCodec::new(compression)?)),
        Compression::Gzip | Compression::Zstd if prefer_external => {
            Ok(Box::new(ProcessCodec::new(compression)?))
        }
        Compression::Gzip | Compression::Zstd => Ok(Box::new(InProcessCodec::new(compression))),
    }
}

/// Codecs implemented with `flate2` and `zstd`.
#[derive(Debug, Clone, Copy)]
pub struct InProcessCodec {
    compression: Compression,
    level: u32,
}

impl InProcessCodec {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Sets the compression level (clamped to 1-9 for gzip, 1-19 for zstd).
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = match self.compression {
            Compression::Zstd => level.clamp(1, 19),
            _ => level.clamp(1, 9),
        };
        self
    }
}

impl Codec for InProcessCodec {
    fn compression(&self) -> Compression {
        self.compression
    }

    fn open_reader(&self, file: File) -> Result<Box<dyn Read + Send>> {
        match self.compression {
            Compression::None => Ok(Box::new(file)),
            Compression::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(file))),
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(file)
                    .map_err(|e| BackupError::io("zstd decoder", e))?;
                Ok(Box::new(decoder))
            }
            Compression::Xz => Err(BackupError::InvalidOptions(
                "xz has no in-process codec; use the external xz binary".to_string(),
            )),
        }
    }

    fn create_writer(&self, file: File) -> Result<Box<dyn EncodeWriter>> {
        match self.compression {
            Compression::None => Ok(Box::new(PlainWriter(file))),
            Compression::Gzip => Ok(Box::new(GzipWriter(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::new(self.level),
            )))),
            Compression::Zstd => {
                let encoder = zstd::stream::write::Encoder::new(file, self.level as i32)
                    .map_err(|e| BackupError::io("zstd encoder", e))?;
                Ok(Box::new(ZstdWriter(encoder)))
            }
            Compression::Xz => Err(BackupError::InvalidOptions(
                "xz has no in-process codec; use the external xz binary".to_string(),
            )),
        }
    }
}

struct PlainWriter(File);

impl Write for PlainWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl EncodeWriter for PlainWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_all()
    }
}

struct GzipWriter(flate2::write::GzEncoder<File>);

impl Write for GzipWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl EncodeWriter for GzipWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.0.finish()?;
        file.sync_all()
    }
}

struct ZstdWriter(zstd::stream::write::Encoder<'static, File>);

impl Write for ZstdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl EncodeWriter for ZstdWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.0.finish()?;
        file.sync_all()
    }
}

/// Codec backed by an external binary (`gzip`, `xz`, `zstd`).
#[derive(Debug, Clone)]
pub struct ProcessCodec {
    compression: Compression,
    program: PathBuf,
}

impl ProcessCodec {
    /// Locates the binary for `compression` on `PATH`.
    pub fn new(compression: Compression) -> Result<Self> {
        let name = compression.program().ok_or_else(|| {
            BackupError::InvalidOptions("uncompressed dumps need no external codec".to_string())
        })?;
        let program = which::which(name).map_err(|e| BackupError::Spawn {
            program: name.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
        })?;
        Ok(Self::with_program(compression, program))
    }

    /// Uses an explicit binary path.
    pub fn with_program(compression: Compression, program: impl Into<PathBuf>) -> Self {
        Self {
            compression,
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn spawn(&self, args: &[&str], stdin: Stdio, stdout: Stdio) -> Result<ChildGuard> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::Spawn {
                program: self.program_name(),
                source: e,
            })?;
        tracing::debug!("Spawned {} {}", self.program_name(), args.join(" "));
        Ok(ChildGuard::new(child, self.program_name()))
    }

    fn quiet_args(&self, decompress: bool) -> Vec<&'static str> {
        let mut args = Vec::new();
        if decompress {
            args.push("-d");
        }
        args.push("-c");
        if self.compression == Compression::Zstd {
            args.push("-q");
        }
        args
    }
}

impl Codec for ProcessCodec {
    fn compression(&self) -> Compression {
        self.compression
    }

    fn open_reader(&self, file: File) -> Result<Box<dyn Read + Send>> {
        let mut guard = self.spawn(&self.quiet_args(true), Stdio::from(file), Stdio::piped())?;
        let stdout = guard.take_stdout();
        Ok(Box::new(ProcessReader {
            stdout,
            guard,
            finished: false,
        }))
    }

    fn create_writer(&self, file: File) -> Result<Box<dyn EncodeWriter>> {
        let mut guard = self.spawn(&self.quiet_args(false), Stdio::piped(), Stdio::from(file))?;
        let stdin = guard.take_stdin();
        Ok(Box::new(ProcessWriter { stdin, guard }))
    }
}

/// Owns a codec child process.
///
/// Dropping the guard without a successful [`wait_success`](Self::wait_success)
/// kills the child if it is still running and always reaps it.
struct ChildGuard {
    child: Option<Child>,
    stderr: Option<ChildStderr>,
    program: String,
}

impl ChildGuard {
    fn new(mut child: Child, program: String) -> Self {
        let stderr = child.stderr.take();
        Self {
            child: Some(child),
            stderr,
            program,
        }
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    /// Drains stderr, waits for exit and maps a failure status to an error.
    fn wait_success(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = self.stderr.take() {
            // Lossy: diagnostics only
            let mut raw = Vec::new();
            let _ = pipe.read_to_end(&mut raw);
            stderr = String::from_utf8_lossy(&raw).into_owned();
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(BackupError::ProcessFailed {
                program: self.program.clone(),
                status: status.to_string(),
                stderr,
            }))
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.stderr.take();
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
            tracing::debug!("Reaped {} after early release", self.program);
        }
    }
}

struct ProcessReader {
    stdout: Option<ChildStdout>,
    guard: ChildGuard,
    finished: bool,
}

impl Read for ProcessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf)?,
            None => 0,
        };
        if n == 0 {
            self.finished = true;
            self.stdout.take();
            self.guard.wait_success()?;
        }
        Ok(n)
    }
}

struct ProcessWriter {
    stdin: Option<ChildStdin>,
    guard: ChildGuard,
}

impl Write for ProcessWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "codec input already closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl EncodeWriter for ProcessWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        self.guard.wait_success()
    }
}

/// Calculates the SHA256 checksum of a file.
pub fn calculate_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| BackupError::io(path.display(), e))?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| BackupError::io(path.display(), e))?;

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}
