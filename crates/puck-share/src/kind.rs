//! File kind classification by extension.

use std::path::Path;

use puck_proto::FileKind;

const AUDIO: &[&str] = &[
    "mp3", "mp2", "wav", "au", "rm", "mid", "sm", "ogg", "flac", "m4a", "aac", "wma",
];
const COMPRESSED: &[&str] = &[
    "zip", "arj", "rar", "lzh", "gz", "z", "arc", "pak", "7z", "bz2", "tar", "tgz",
];
const DOCUMENT: &[&str] = &[
    "doc", "docx", "txt", "wri", "pdf", "ps", "tex", "rtf", "htm", "html", "xml", "odt",
];
const EXECUTABLE: &[&str] = &["exe", "bat", "com", "dll", "app", "sh", "bin", "msi"];
const IMAGE: &[&str] = &[
    "gif", "jpg", "jpeg", "bmp", "pcx", "png", "wmf", "psd", "tif", "tiff", "svg",
];
const MOVIE: &[&str] = &[
    "mpg", "mpeg", "avi", "asf", "mov", "mkv", "mp4", "wmv", "divx", "flv", "webm", "pxp",
];

/// Classify a file name by its extension; unknown extensions are `Any`.
#[must_use]
pub fn classify(path: &Path) -> FileKind {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return FileKind::Any;
    };
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();

    if AUDIO.contains(&ext) {
        FileKind::Audio
    } else if COMPRESSED.contains(&ext) {
        FileKind::Compressed
    } else if DOCUMENT.contains(&ext) {
        FileKind::Document
    } else if EXECUTABLE.contains(&ext) {
        FileKind::Executable
    } else if IMAGE.contains(&ext) {
        FileKind::Image
    } else if MOVIE.contains(&ext) {
        FileKind::Movie
    } else {
        FileKind::Any
    }
}
