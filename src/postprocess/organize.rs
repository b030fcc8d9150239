use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Destination for `file` inside `dest_dir`; on a name collision the stem
/// gets a `_YYYYmmdd_HHMMSS` suffix taken from `now`.
pub fn destination(file: &Path, dest_dir: &Path, now: NaiveDateTime) -> PathBuf {
    let name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let direct = dest_dir.join(&name);
    if !direct.exists() {
        return direct;
    }

    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = now.format("%Y%m%d_%H%M%S");
    match file.extension() {
        Some(ext) => dest_dir.join(format!("{stem}_{stamp}.{}", ext.to_string_lossy())),
        None => dest_dir.join(format!("{stem}_{stamp}")),
    }
}

/// Moves `file` into `dest_dir`, falling back to copy + remove across
/// file systems.
pub fn move_into(file: &Path, dest_dir: &Path, now: NaiveDateTime) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let target = destination(file, dest_dir, now);
    if std::fs::rename(file, &target).is_err() {
        std::fs::copy(file, &target)?;
        std::fs::remove_file(file)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 5)
            .unwrap()
            .and_hms_opt(14, 7, 9)
            .unwrap()
    }

    #[test]
    fn moves_into_fresh_directory() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("ACQ_A.pdf");
        std::fs::write(&src, b"a").unwrap();
        let dest = tmp.path().join("processed");

        let moved = move_into(&src, &dest, now()).unwrap();
        assert_eq!(moved, dest.join("ACQ_A.pdf"));
        assert!(!src.exists());
    }

    #[test]
    fn collision_gets_timestamp_suffix() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("processed");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("ACQ_A.pdf"), b"old").unwrap();
        let src = tmp.path().join("ACQ_A.pdf");
        std::fs::write(&src, b"new").unwrap();

        let moved = move_into(&src, &dest, now()).unwrap();
        assert_eq!(moved, dest.join("ACQ_A_20260305_140709.pdf"));
        assert_eq!(std::fs::read(dest.join("ACQ_A.pdf")).unwrap(), b"old");
    }
}
