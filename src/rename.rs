//! Rename execution: builds the destination beside the original, resolves
//! collisions deterministically, and performs the move atomically.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::ai::RESERVED_CHARS;
use crate::error::TaskError;

/// Renames `original` to the candidate name in the same directory, keeping
/// the original extension. If the destination is taken, probes `_2`, `_3`,
/// … until a free name is found; an existing file is never overwritten.
///
/// The chosen destination is reserved with a create-new before the move so
/// concurrent workers cannot claim the same name; the move itself is a
/// single `fs::rename`. On failure the original file is left untouched.
pub fn rename(original: &Path, candidate: &str) -> Result<PathBuf, TaskError> {
    if candidate.trim().is_empty()
        || candidate
            .chars()
            .any(|c| RESERVED_CHARS.contains(&c) || c.is_control())
    {
        return Err(TaskError::Filesystem(format!(
            "illegal candidate name: {candidate:?}"
        )));
    }

    let dir = original
        .parent()
        .ok_or_else(|| TaskError::Filesystem("original file has no parent directory".into()))?;
    let build = |stem: &str| -> PathBuf {
        let mut name = OsString::from(stem);
        if let Some(ext) = original.extension() {
            name.push(".");
            name.push(ext);
        }
        dir.join(name)
    };

    let mut destination = build(candidate);
    let mut reserved = false;
    let mut suffix = 2u32;
    loop {
        if destination == original {
            // The file already carries this name; renaming onto itself is
            // a successful no-op.
            break;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
        {
            Ok(_) => {
                reserved = true;
                break;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                destination = build(&format!("{candidate}_{suffix}"));
                suffix += 1;
            }
            Err(err) => {
                return Err(TaskError::Filesystem(format!(
                    "cannot reserve {}: {err}",
                    destination.display()
                )));
            }
        }
    }

    if let Err(err) = fs::rename(original, &destination) {
        if reserved {
            let _ = fs::remove_file(&destination);
        }
        return Err(TaskError::Filesystem(format!(
            "cannot rename {} to {}: {err}",
            original.display(),
            destination.display()
        )));
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn renames_and_preserves_extension() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("20250101_123030.mp4");
        fs::write(&original, b"video").unwrap();

        let renamed = rename(&original, "101동 101호 급수").unwrap();
        assert_eq!(renamed, dir.path().join("101동 101호 급수.mp4"));
        assert!(!original.exists());
        assert_eq!(fs::read(&renamed).unwrap(), b"video");
    }

    #[test]
    fn collisions_resolve_to_numbered_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("video.mp4"), b"occupied").unwrap();

        let first = dir.path().join("a.mp4");
        fs::write(&first, b"first").unwrap();
        assert_eq!(
            rename(&first, "video").unwrap(),
            dir.path().join("video_2.mp4")
        );

        let second = dir.path().join("b.mp4");
        fs::write(&second, b"second").unwrap();
        assert_eq!(
            rename(&second, "video").unwrap(),
            dir.path().join("video_3.mp4")
        );

        // The occupant is never touched.
        assert_eq!(fs::read(dir.path().join("video.mp4")).unwrap(), b"occupied");
        assert_eq!(fs::read(dir.path().join("video_2.mp4")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("video_3.mp4")).unwrap(), b"second");
    }

    #[test]
    fn renaming_to_current_name_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("already named.mp4");
        fs::write(&original, b"video").unwrap();

        let renamed = rename(&original, "already named").unwrap();
        assert_eq!(renamed, original);
        assert_eq!(fs::read(&original).unwrap(), b"video");
    }

    #[test]
    fn files_without_extension_keep_none() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("rawclip");
        fs::write(&original, b"video").unwrap();

        let renamed = rename(&original, "named").unwrap();
        assert_eq!(renamed, dir.path().join("named"));
    }

    #[test]
    fn illegal_candidates_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("clip.mp4");
        fs::write(&original, b"video").unwrap();

        for candidate in ["", "  ", "a/b", "a:b"] {
            let err = rename(&original, candidate).unwrap_err();
            assert!(matches!(err, TaskError::Filesystem(_)));
        }
        assert!(original.exists());
    }

    #[test]
    fn missing_source_fails_and_leaves_no_leftover_destination() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("gone.mp4");

        let err = rename(&original, "named").unwrap_err();
        assert!(matches!(err, TaskError::Filesystem(_)));
        assert!(!dir.path().join("named.mp4").exists());
    }
}
