//! Binary patcher: locates a shared library containing a known certificate
//! byte sequence and performs a length-preserving in-place replacement,
//! with a reversible backup.
//!
//! The locate/patch/unpatch contract is byte-exact and single-use: a
//! located handle captures the whole file image once, and a second
//! `patch()` call on the same handle fails rather than silently re-patching
//! an already-patched file.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CastforgeError, Result};

/// The platform's shared-library filename suffix.
///
/// The darwin case is preserved as documented in the source tool: it
/// matches files whose *name* ends in the literal string `Framework`,
/// which is unusual since Cast frameworks ship as directories, not files
/// with that literal suffix. That behavior is carried over unmodified
/// rather than silently corrected, per an open design question about the
/// tool this is modeled on. Unlike the source, unsupported platforms
/// return a `ConfigurationError` rather than panicking.
pub fn platform_suffix() -> Result<&'static str> {
    match std::env::consts::OS {
        "windows" => Ok(".dll"),
        "macos" => Ok("Framework"),
        "linux" => Ok(".so"),
        other => Err(CastforgeError::Configuration(format!(
            "no shared-library suffix configured for platform {other}"
        ))),
    }
}

/// A located on-disk shared library, captured for a single patch or
/// unpatch operation.
pub struct PatchableFile {
    path: PathBuf,
    /// The full file image at location time. `None` once the handle has
    /// been consumed by a successful `patch()`.
    image: Option<Vec<u8>>,
    mode: u32,
    offset: usize,
    original_len: usize,
}

impl PatchableFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// Replace the captured `[offset, offset+original_len)` window with
    /// `replacement` and write the result back in place, after writing a
    /// `<path>.bak` backup of the pre-patch image.
    ///
    /// Fails without writing anything if the handle has already been used,
    /// or if `replacement`'s length does not match the original window.
    pub fn patch(&mut self, replacement: &[u8]) -> Result<()> {
        let Some(image) = self.image.as_ref() else {
            return Err(CastforgeError::Patch(
                "patch cannot be run a second time".to_string(),
            ));
        };

        if replacement.len() != self.original_len {
            return Err(CastforgeError::Patch(format!(
                "replacement length {} does not match original length {}",
                replacement.len(),
                self.original_len
            )));
        }

        let backup_path = backup_path_for(&self.path);
        write_with_mode(&backup_path, image, self.mode)?;

        let mut patched = image.clone();
        patched[self.offset..self.offset + self.original_len].copy_from_slice(replacement);
        write_with_mode(&self.path, &patched, self.mode)?;

        info!(path = %self.path.display(), backup = %backup_path.display(), "patched shared library");
        self.image = None;
        Ok(())
    }

    /// Restore `<path without .bak>` from this backup handle's captured
    /// image, then remove the `.bak` file. Requires `path` to end in
    /// `.bak`.
    pub fn unpatch(&self) -> Result<()> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| CastforgeError::Patch("backup path is not valid UTF-8".to_string()))?;
        let orig_str = path_str.strip_suffix(".bak").ok_or_else(|| {
            CastforgeError::Patch("unpatch handle does not point at a .bak file".to_string())
        })?;
        let orig_path = PathBuf::from(orig_str);

        let image = self.image.as_ref().ok_or_else(|| {
            CastforgeError::Patch("backup handle has no captured image".to_string())
        })?;
        write_with_mode(&orig_path, image, self.mode)?;

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "unpatched but cleanup of .bak failed");
        }

        info!(path = %orig_path.display(), "restored from backup");
        Ok(())
    }
}

/// Locate a shared library under `start_dir` whose contents contain
/// `original_root_der` as a contiguous substring, using the platform's
/// default suffix.
pub fn locate_for_patch(start_dir: &Path, original_root_der: &[u8]) -> Result<PatchableFile> {
    locate(start_dir, platform_suffix()?, original_root_der)
}

/// Locate a `<suffix>.bak` backup under `start_dir` for a reversible
/// unpatch.
pub fn locate_for_unpatch(start_dir: &Path, original_root_der: &[u8]) -> Result<PatchableFile> {
    let suffix = format!("{}.bak", platform_suffix()?);
    locate(start_dir, &suffix, original_root_der)
}

/// Walk `start_dir` recursively; the first non-directory file whose name
/// ends in `suffix` and whose contents contain `needle` wins. The walk
/// stops descending as soon as a match is found.
fn locate(start_dir: &Path, suffix: &str, needle: &[u8]) -> Result<PatchableFile> {
    let mut pending = vec![start_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }

            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(suffix) {
                continue;
            }

            let image = std::fs::read(&path)?;
            if let Some(offset) = find_subslice(&image, needle) {
                let mode = file_mode(&path)?;
                debug!(path = %path.display(), offset, "located patchable file");
                return Ok(PatchableFile {
                    path,
                    image: Some(image),
                    mode,
                    offset,
                    original_len: needle.len(),
                });
            }
        }
    }

    Err(CastforgeError::Patch(
        "unable to find shared lib with cert".to_string(),
    ))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

#[cfg(unix)]
fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, data: &[u8], _mode: u32) -> Result<()> {
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_lib(dir: &Path, name: &str, original: &[u8]) -> PathBuf {
        let mut rng_bytes = vec![0u8; 4096];
        for (i, b) in rng_bytes.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        rng_bytes[1024..1024 + original.len()].copy_from_slice(original);

        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&rng_bytes).unwrap();
        path
    }

    #[test]
    fn patch_round_trip_restores_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0xABu8; 512];
        let replacement = vec![0xCDu8; 512];
        let lib_path = scratch_lib(dir.path(), "libcast.so", &original);
        let before = std::fs::read(&lib_path).unwrap();

        let mut handle = locate(dir.path(), ".so", &original).unwrap();
        handle.patch(&replacement).unwrap();

        let patched = std::fs::read(&lib_path).unwrap();
        assert_eq!(&patched[1024..1024 + 512], replacement.as_slice());
        assert_eq!(&patched[..1024], &before[..1024]);
        assert_eq!(&patched[1536..], &before[1536..]);

        let backup_path = backup_path_for(&lib_path);
        let backup = std::fs::read(&backup_path).unwrap();
        assert_eq!(backup, before);

        let unpatch_handle = locate(dir.path(), ".so.bak", &original).unwrap();
        unpatch_handle.unpatch().unwrap();

        let restored = std::fs::read(&lib_path).unwrap();
        assert_eq!(restored, before);
        assert!(!backup_path.exists());
    }

    #[test]
    fn double_patch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0xABu8; 512];
        let replacement = vec![0xCDu8; 512];
        scratch_lib(dir.path(), "libcast.so", &original);

        let mut handle = locate(dir.path(), ".so", &original).unwrap();
        handle.patch(&replacement).unwrap();

        let result = handle.patch(&replacement);
        assert!(matches!(result, Err(CastforgeError::Patch(_))));
    }

    #[test]
    fn length_mismatch_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![0xABu8; 512];
        let short_replacement = vec![0xCDu8; 511];
        let lib_path = scratch_lib(dir.path(), "libcast.so", &original);
        let before = std::fs::read(&lib_path).unwrap();

        let mut handle = locate(dir.path(), ".so", &original).unwrap();
        let result = handle.patch(&short_replacement);
        assert!(matches!(result, Err(CastforgeError::Patch(_))));

        // Nothing should have been written to disk.
        let after = std::fs::read(&lib_path).unwrap();
        assert_eq!(before, after);
        assert!(!backup_path_for(&lib_path).exists());
    }

    #[test]
    fn locate_fails_when_no_match() {
        let dir = tempfile::tempdir().unwrap();
        scratch_lib(dir.path(), "libcast.so", &[0xABu8; 512]);

        let result = locate(dir.path(), ".so", &[0xFFu8; 512]);
        assert!(matches!(result, Err(CastforgeError::Patch(_))));
    }

    #[test]
    fn locate_skips_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        let original = vec![0xABu8; 512];
        scratch_lib(&nested, "libcast.so", &original);

        let handle = locate(dir.path(), ".so", &original).unwrap();
        assert_eq!(handle.path(), nested.join("libcast.so"));
    }
}
