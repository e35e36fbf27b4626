//! Streaming edits of gzip-compressed tar snapshots.
//!
//! Entries are copied one at a time from the source archive into a fresh
//! destination, so memory use is bounded by a single read buffer regardless of
//! snapshot size. Headers of copied entries are written back unchanged;
//! long names and PAX records that the reader folded into an entry are
//! re-emitted in front of it.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header};
use tracing::debug;

pub const DEFAULT_DEPLOYMENTS_DIR: &str = "deployments";

/// Name stored in the header of GNU long-name and long-link records.
const GNU_LONG_LINK: &[u8] = b"././@LongLink";

/// Errors produced while rewriting an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("unsupported archive entry '{path}': {reason}")]
    Unsupported { path: String, reason: String },

    #[error("entry '{name}' declared {declared} bytes but its content has {actual}")]
    SizeMismatch {
        name: String,
        declared: u64,
        actual: String,
    },

    #[error("invalid entry name: {0}")]
    InvalidEntryName(String),

    #[error("failed to write archive: {0}")]
    Write(String),

    #[error("failed to read entry content: {0}")]
    Content(String),
}

/// What a patch run did to the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    /// Entries carried over from the source archive.
    pub copied: usize,
    /// Paths of entries dropped by `remove`.
    pub removed: Vec<String>,
    /// Path of the entry added by `append`.
    pub added: Option<String>,
}

/// Adds or removes one artifact entry in a tar+gzip snapshot stream.
#[derive(Debug, Clone)]
pub struct ArchivePatcher {
    deployments_dir: String,
}

impl Default for ArchivePatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DEPLOYMENTS_DIR)
    }
}

impl ArchivePatcher {
    pub fn new(deployments_dir: impl Into<String>) -> Self {
        Self {
            deployments_dir: deployments_dir.into(),
        }
    }

    /// Archive path an artifact named `entry_name` is deployed under.
    pub fn entry_path(&self, entry_name: &str) -> String {
        format!(
            "/repo/{}/{}",
            self.deployments_dir.trim_matches('/'),
            entry_name
        )
    }

    /// Copy every entry of `archive_in` into `out`, then add `content` as
    /// `/repo/<deployments_dir>/<entry_name>`.
    ///
    /// `content` must yield exactly `entry_size` bytes.
    pub fn append<R: Read, C: Read, W: Write>(
        &self,
        archive_in: R,
        content: C,
        entry_name: &str,
        entry_size: u64,
        out: W,
    ) -> Result<PatchSummary, ArchiveError> {
        validate_entry_name(entry_name)?;

        let mut archive = tar::Archive::new(GzDecoder::new(archive_in));
        let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
        let mut summary = PatchSummary::default();

        copy_entries(&mut archive, &mut builder, |_| true, &mut summary)?;

        let path = self.entry_path(entry_name);
        append_new_entry(&mut builder, &path, content, entry_size)?;
        debug!(entry = %path, size = entry_size, "appended artifact entry");
        summary.added = Some(path);

        finish(builder)?;
        Ok(summary)
    }

    /// Copy every entry of `archive_in` whose path does not contain
    /// `name_fragment` into `out`.
    ///
    /// An archive with no matching entry is copied unchanged.
    pub fn remove<R: Read, W: Write>(
        &self,
        archive_in: R,
        name_fragment: &str,
        out: W,
    ) -> Result<PatchSummary, ArchiveError> {
        if name_fragment.is_empty() {
            return Err(ArchiveError::InvalidEntryName(
                "cannot remove entries matching an empty name".into(),
            ));
        }

        let mut archive = tar::Archive::new(GzDecoder::new(archive_in));
        let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
        let mut summary = PatchSummary::default();
        let needle = name_fragment.as_bytes();

        copy_entries(
            &mut archive,
            &mut builder,
            |path| !contains(path, needle),
            &mut summary,
        )?;

        finish(builder)?;
        Ok(summary)
    }
}

pub(crate) fn validate_entry_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ArchiveError::InvalidEntryName(format!(
            "'{name}' is not a plain file name"
        )));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn corrupt(context: &str) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |e| ArchiveError::Corrupt(format!("{context}: {e}"))
}

fn write_error(e: io::Error) -> ArchiveError {
    ArchiveError::Write(e.to_string())
}

fn copy_entries<R: Read, W: Write>(
    archive: &mut tar::Archive<R>,
    builder: &mut Builder<W>,
    mut keep: impl FnMut(&[u8]) -> bool,
    summary: &mut PatchSummary,
) -> Result<(), ArchiveError> {
    let entries = archive
        .entries()
        .map_err(corrupt("failed to read tar entries"))?;

    for entry_result in entries {
        let mut entry = entry_result.map_err(corrupt("failed to read tar entry"))?;
        let path = entry.path_bytes().into_owned();

        if !keep(path.as_slice()) {
            // Unread entry data is skipped by the next iteration.
            let removed = String::from_utf8_lossy(&path).into_owned();
            debug!(entry = %removed, "removed entry");
            summary.removed.push(removed);
            continue;
        }

        copy_entry(builder, &mut entry, &path)?;
        summary.copied += 1;
    }

    Ok(())
}

fn copy_entry<R: Read, W: Write>(
    builder: &mut Builder<W>,
    entry: &mut tar::Entry<'_, R>,
    path: &[u8],
) -> Result<(), ArchiveError> {
    let mut header = entry.header().clone();

    if header.entry_type() == EntryType::GNUSparse {
        return Err(ArchiveError::Unsupported {
            path: String::from_utf8_lossy(path).into_owned(),
            reason: "GNU sparse entries cannot be re-encoded".into(),
        });
    }

    let link = entry.link_name_bytes().map(Cow::into_owned);

    // A global header's records are its own body and are copied as data.
    let mut pax = Vec::new();
    let carries_pax = !matches!(
        header.entry_type(),
        EntryType::XGlobalHeader | EntryType::XHeader
    );
    if carries_pax
        && let Some(extensions) = entry
            .pax_extensions()
            .map_err(corrupt("failed to read PAX extensions"))?
    {
        for extension in extensions {
            let extension = extension.map_err(corrupt("malformed PAX record"))?;
            let key = extension
                .key()
                .map_err(|e| ArchiveError::Corrupt(format!("non UTF-8 PAX key: {e}")))?;
            pax.push((key.to_owned(), extension.value_bytes().to_vec()));
        }
    }

    let pax_has = |wanted: &str| pax.iter().any(|(key, _)| key == wanted);
    let pax_path = pax_has("path");
    let pax_link = pax_has("linkpath");

    if !pax.is_empty() {
        builder
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
            .map_err(write_error)?;
    }

    let mut rewritten = false;
    if !pax_path && header.path_bytes().as_ref() != path {
        append_long_record(builder, EntryType::GNULongName, path)?;
        set_name_field(&mut header, path);
        rewritten = true;
    }
    if let Some(link) = &link
        && !pax_link
        && header.link_name_bytes().as_deref() != Some(link.as_slice())
    {
        append_long_record(builder, EntryType::GNULongLink, link)?;
        set_link_field(&mut header, link);
        rewritten = true;
    }
    if rewritten {
        header.set_cksum();
    }

    let declared = entry.size();
    let mut data = ExactReader::new(entry, declared);
    if let Err(e) = builder.append(&header, &mut data) {
        return Err(match data.failure {
            Some(_) => ArchiveError::Corrupt(format!(
                "entry '{}' is truncated: {e}",
                String::from_utf8_lossy(path)
            )),
            None => write_error(e),
        });
    }

    Ok(())
}

fn append_new_entry<C: Read, W: Write>(
    builder: &mut Builder<W>,
    path: &str,
    content: C,
    size: u64,
) -> Result<(), ArchiveError> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );

    let bytes = path.as_bytes();
    if bytes.len() > header.as_old().name.len() {
        append_long_record(builder, EntryType::GNULongName, bytes)?;
    }
    set_name_field(&mut header, bytes);
    header.set_cksum();

    let mut data = ExactReader::new(content, size);
    if let Err(e) = builder.append(&header, &mut data) {
        return Err(match data.failure {
            Some(SourceFailure::Short) => ArchiveError::SizeMismatch {
                name: path.to_owned(),
                declared: size,
                actual: data.consumed.to_string(),
            },
            Some(SourceFailure::Read) => ArchiveError::Content(e.to_string()),
            None => write_error(e),
        });
    }

    let mut byte = [0u8; 1];
    let extra = data
        .inner
        .read(&mut byte)
        .map_err(|e| ArchiveError::Content(e.to_string()))?;
    if extra > 0 {
        return Err(ArchiveError::SizeMismatch {
            name: path.to_owned(),
            declared: size,
            actual: format!("more than {size}"),
        });
    }

    Ok(())
}

/// Emit a GNU `L`/`K` record carrying a name that does not fit in a header.
fn append_long_record<W: Write>(
    builder: &mut Builder<W>,
    kind: EntryType,
    value: &[u8],
) -> Result<(), ArchiveError> {
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..GNU_LONG_LINK.len()].copy_from_slice(GNU_LONG_LINK);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    // NUL terminated, like GNU tar writes it.
    header.set_size(value.len() as u64 + 1);
    header.set_entry_type(kind);
    header.set_cksum();

    builder
        .append(&header, value.chain(&b"\0"[..]))
        .map_err(write_error)
}

fn set_name_field(header: &mut Header, path: &[u8]) {
    let name = &mut header.as_old_mut().name;
    name.fill(0);
    let len = path.len().min(name.len());
    name[..len].copy_from_slice(&path[..len]);

    if let Some(ustar) = header.as_ustar_mut() {
        ustar.prefix.fill(0);
    }
}

fn set_link_field(header: &mut Header, link: &[u8]) {
    let field = &mut header.as_old_mut().linkname;
    field.fill(0);
    let len = link.len().min(field.len());
    field[..len].copy_from_slice(&link[..len]);
}

fn finish<W: Write>(builder: Builder<GzEncoder<W>>) -> Result<(), ArchiveError> {
    let encoder = builder.into_inner().map_err(write_error)?;
    let mut out = encoder.finish().map_err(write_error)?;
    out.flush().map_err(write_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFailure {
    /// The source ended before the declared size.
    Short,
    /// The source returned an I/O error.
    Read,
}

/// Yields exactly `remaining` bytes from `inner` and fails loudly if the
/// source runs dry first. `tar::Builder::append` pads short data silently,
/// so the length check has to happen on the read side.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    consumed: u64,
    failure: Option<SourceFailure>,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            consumed: 0,
            failure: None,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = match self.inner.read(&mut buf[..max]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                self.failure = Some(SourceFailure::Read);
                return Err(e);
            }
        };

        if n == 0 {
            self.failure = Some(SourceFailure::Short);
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended {} bytes early", self.remaining),
            ));
        }

        self.remaining -= n as u64;
        self.consumed += n as u64;
        Ok(n)
    }
}
