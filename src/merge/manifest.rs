//! ffmpeg concat demuxer manifests.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Quote a path for a `file '...'` manifest line. Single quotes close the
/// quoted string, emit an escaped quote and reopen it.
pub(crate) fn escape_manifest_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let raw = if cfg!(windows) {
        raw.replace('\\', "/")
    } else {
        raw.into_owned()
    };
    raw.replace('\'', r"'\''")
}

pub(crate) fn render_manifest<'a>(videos: impl IntoIterator<Item = &'a Path>) -> String {
    videos
        .into_iter()
        .map(|path| format!("file '{}'\n", escape_manifest_path(path)))
        .collect()
}

pub(crate) fn write_manifest<'a>(
    manifest: &Path,
    videos: impl IntoIterator<Item = &'a Path>,
) -> Result<()> {
    let body = render_manifest(videos);
    crate::log_debug(&format!("concat manifest:\n{body}"));
    fs::write(manifest, body)
        .with_context(|| format!("failed to write concat manifest {}", manifest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_per_video_in_order() {
        let body = render_manifest([Path::new("a.mp4"), Path::new("b.mp4")]);
        assert_eq!(body, "file 'a.mp4'\nfile 'b.mp4'\n");
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(
            escape_manifest_path(Path::new("it's.mp4")),
            r"it'\''s.mp4"
        );
    }
}
