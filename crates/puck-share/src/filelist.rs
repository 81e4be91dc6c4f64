//! Filelist parsing and generation.
//!
//! Peers advertise their share as an XML document (`files.xml`, usually
//! bzip2-compressed on the wire) or, from ancient clients, as the
//! tab-indented `MyList` text format. Paths inside filelists are
//! `\`-separated and the root has no path.
//!
//! The XML parser runs in two modes: materialise the whole tree, or hand
//! every file to a callback and keep nothing, which is how queued
//! directories are resolved without holding a large list in memory.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use puck_hash::Tth;
use puck_proto::{FileKind, HubEncoding};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

use crate::kind;
use crate::share::Share;
use crate::tth_store::TthStore;

/// Errors from filelist handling
#[derive(Debug, Error)]
pub enum FilelistError {
    /// Reading or writing the list failed
    #[error("filelist I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The XML was unusable
    #[error("filelist parse: {0}")]
    Parse(String),

    /// The compression format cannot be decoded
    #[error("filelist codec: {0}")]
    Codec(&'static str),
}

/// One entry in a parsed filelist
#[derive(Debug)]
pub struct FlFile {
    /// Entry name without any path
    pub name: String,
    /// Extension-derived kind; `Directory` for subdirectories
    pub kind: FileKind,
    /// Size in bytes; zero for directories
    pub size: u64,
    /// Content hash, when the remote list carries one
    pub tth: Option<Tth>,
    /// Present when this entry is a subdirectory
    pub dir: Option<FlDir>,
}

/// A parsed directory level
#[derive(Debug, Default)]
pub struct FlDir {
    /// `\`-separated path from the root; empty at the root
    pub path: String,
    /// Entries in document order
    pub files: Vec<FlFile>,
    /// Total entries below this level, subdirectory entries included
    pub nfiles: u32,
    /// Total bytes below this level
    pub size: u64,
}

impl FlDir {
    /// Find a subdirectory by its `\`-separated path
    #[must_use]
    pub fn find_directory(&self, path: &str) -> Option<&FlDir> {
        if self.path == path {
            return Some(self);
        }
        self.files
            .iter()
            .filter_map(|f| f.dir.as_ref())
            .find_map(|d| d.find_directory(path))
    }

    /// Visit every leaf file under this level with its full path
    pub fn each_leaf(&self, visit: &mut impl FnMut(&str, &FlFile)) {
        for file in &self.files {
            match &file.dir {
                Some(dir) => dir.each_leaf(visit),
                None => {
                    let path = if self.path.is_empty() {
                        file.name.clone()
                    } else {
                        format!("{}\\{}", self.path, file.name)
                    };
                    visit(&path, file);
                }
            }
        }
    }
}

/// The conventional on-disk name for a nick's fetched filelist
#[must_use]
pub fn filelist_path(workdir: &Path, nick: &str) -> PathBuf {
    workdir.join(format!("files.xml.{nick}"))
}

/// Locate a previously fetched filelist for `nick`, any variant
#[must_use]
pub fn find_filelist(workdir: &Path, nick: &str) -> Option<PathBuf> {
    let candidates = [
        workdir.join(format!("files.xml.{nick}")),
        workdir.join(format!("files.xml.{nick}.bz2")),
        workdir.join(format!("{nick}.DcLst")),
    ];
    candidates.into_iter().find(|p| p.exists())
}

/// Decompress a fetched filelist into a sibling cache file when needed.
///
/// `.bz2` lists are unpacked next to the source; the cache is reused as
/// long as it is not older than the compressed file. The legacy HE3
/// compression of `.DcLst` lists is not decoded.
///
/// # Errors
///
/// Fails with [`FilelistError::Codec`] for HE3 input and with
/// [`FilelistError::Io`] when decompression fails.
pub fn unpack(path: &Path) -> Result<PathBuf, FilelistError> {
    let name = path.to_string_lossy();

    if let Some(plain) = name.strip_suffix(".bz2") {
        let target = PathBuf::from(plain);

        if let (Ok(cached), Ok(source)) = (target.metadata(), path.metadata()) {
            if let (Ok(cached), Ok(source)) = (cached.modified(), source.modified()) {
                if cached >= source {
                    debug!(target = %target.display(), "reusing decompressed filelist");
                    return Ok(target);
                }
            }
        }

        let mut decoder = bzip2::read::BzDecoder::new(File::open(path)?);
        let mut out = File::create(&target)?;
        std::io::copy(&mut decoder, &mut out)?;
        return Ok(target);
    }

    if name.ends_with(".DcLst") {
        return Err(FilelistError::Codec("HE3-compressed lists are not supported"));
    }

    Ok(path.to_path_buf())
}

/// Parse a filelist into a materialised tree, decompressing first when
/// necessary.
///
/// # Errors
///
/// Propagates [`unpack`] and XML parse failures.
pub fn parse(path: &Path) -> Result<FlDir, FilelistError> {
    let plain = unpack(path)?;
    parse_xml(&plain)
}

/// Parse an XML filelist into a tree
///
/// # Errors
///
/// Fails with [`FilelistError::Parse`] on malformed XML.
pub fn parse_xml(path: &Path) -> Result<FlDir, FilelistError> {
    let mut root = FlDir::default();
    let mut stack: Vec<FlDir> = Vec::new();

    visit_xml(path, |event| {
        match event {
            XmlNode::DirStart(name) => {
                let parent = stack.last().unwrap_or(&root);
                let path = if parent.path.is_empty() {
                    name.clone()
                } else {
                    format!("{}\\{name}", parent.path)
                };
                stack.push(FlDir {
                    path,
                    ..FlDir::default()
                });
            }
            XmlNode::DirEnd => {
                if let Some(done) = stack.pop() {
                    let parent = stack.last_mut().unwrap_or(&mut root);
                    parent.nfiles += done.nfiles + 1;
                    parent.size += done.size;
                    let name = done
                        .path
                        .rsplit('\\')
                        .next()
                        .unwrap_or(&done.path)
                        .to_string();
                    parent.files.push(FlFile {
                        name,
                        kind: FileKind::Directory,
                        size: done.size,
                        tth: None,
                        dir: Some(done),
                    });
                }
            }
            XmlNode::File { name, size, tth } => {
                let current = stack.last_mut().unwrap_or(&mut root);
                current.nfiles += 1;
                current.size += size;
                current.files.push(FlFile {
                    kind: kind::classify(Path::new(&name)),
                    name,
                    size,
                    tth,
                    dir: None,
                });
            }
        }
        Ok(())
    })?;

    Ok(root)
}

/// Stream a filelist through a per-file callback, keeping no structure.
/// The callback receives the full `\`-separated path, the TTH and the
/// size; files without a TTH are skipped.
///
/// # Errors
///
/// Propagates [`unpack`] and XML parse failures.
pub fn parse_with<F>(path: &Path, mut callback: F) -> Result<(), FilelistError>
where
    F: FnMut(&str, Tth, u64),
{
    let plain = unpack(path)?;
    let mut dirs: Vec<String> = Vec::new();

    visit_xml(&plain, |event| {
        match event {
            XmlNode::DirStart(name) => {
                let path = match dirs.last() {
                    Some(parent) => format!("{parent}\\{name}"),
                    None => name,
                };
                dirs.push(path);
            }
            XmlNode::DirEnd => {
                dirs.pop();
            }
            XmlNode::File { name, size, tth } => {
                if let Some(tth) = tth {
                    let full = match dirs.last() {
                        Some(parent) => format!("{parent}\\{name}"),
                        None => name,
                    };
                    callback(&full, tth, size);
                }
            }
        }
        Ok(())
    })
}

enum XmlNode {
    DirStart(String),
    DirEnd,
    File {
        name: String,
        size: u64,
        tth: Option<Tth>,
    },
}

fn visit_xml(
    path: &Path,
    mut visit: impl FnMut(XmlNode) -> Result<(), FilelistError>,
) -> Result<(), FilelistError> {
    let file = File::open(path)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FilelistError::Parse(e.to_string()))?;

        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let tag = e.name();
                let tag = tag.as_ref();
                let is_empty = matches!(event, Event::Empty(_));

                if tag.eq_ignore_ascii_case(b"Directory") {
                    let mut name = None;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref().eq_ignore_ascii_case(b"Name") {
                            name = attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                    }
                    match name {
                        Some(name) => {
                            visit(XmlNode::DirStart(name))?;
                            if is_empty {
                                visit(XmlNode::DirEnd)?;
                            }
                        }
                        None => warn!("Directory tag without Name attribute"),
                    }
                } else if tag.eq_ignore_ascii_case(b"File") {
                    let (mut name, mut size, mut tth) = (None, 0u64, None);
                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        let value = attr.unescape_value().ok();
                        if key.eq_ignore_ascii_case(b"Name") {
                            name = value.map(|v| v.into_owned());
                        } else if key.eq_ignore_ascii_case(b"Size") {
                            size = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                        } else if key.eq_ignore_ascii_case(b"TTH") {
                            tth = value.and_then(|v| v.parse().ok());
                        }
                    }
                    if let Some(name) = name {
                        visit(XmlNode::File { name, size, tth })?;
                    }
                }
            }
            Event::End(e) => {
                if e.name().as_ref().eq_ignore_ascii_case(b"Directory") {
                    visit(XmlNode::DirEnd)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

/// Parse a legacy tab-indented text list. Lines are Windows-1252 and are
/// decoded lossily; a `|<size>` suffix marks a file, anything else is a
/// directory containing the deeper-indented lines that follow.
///
/// # Errors
///
/// Fails with [`FilelistError::Io`] when the file cannot be read.
pub fn parse_dclst(path: &Path) -> Result<FlDir, FilelistError> {
    let file = File::open(path)?;
    let encoding = HubEncoding::default();

    let mut lines = Vec::new();
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let text = encoding.decode_lossy(&raw);
        lines.push(text.trim_end_matches(['\r', '\n']).to_string());
    }

    let mut iter = lines.into_iter().peekable();
    Ok(parse_dclst_level(&mut iter, 0, String::new()))
}

fn parse_dclst_level(
    lines: &mut std::iter::Peekable<impl Iterator<Item = String>>,
    level: usize,
    path: String,
) -> FlDir {
    let mut dir = FlDir {
        path,
        ..FlDir::default()
    };

    while let Some(line) = lines.peek() {
        let tabs = line.bytes().take_while(|b| *b == b'\t').count();
        if tabs < level || line.is_empty() {
            if line.is_empty() {
                lines.next();
                continue;
            }
            break;
        }

        let line = lines.next().expect("peeked line");
        let body = &line[tabs..];

        if let Some((name, size)) = body.rsplit_once('|') {
            let size: u64 = size.trim().parse().unwrap_or(0);
            dir.nfiles += 1;
            dir.size += size;
            dir.files.push(FlFile {
                kind: kind::classify(Path::new(name)),
                name: name.to_string(),
                size,
                tth: None,
                dir: None,
            });
        } else {
            let sub_path = if dir.path.is_empty() {
                body.to_string()
            } else {
                format!("{}\\{body}", dir.path)
            };
            let sub = parse_dclst_level(lines, level + 1, sub_path);
            dir.nfiles += sub.nfiles + 1;
            dir.size += sub.size;
            dir.files.push(FlFile {
                name: body.to_string(),
                kind: FileKind::Directory,
                size: sub.size,
                tth: None,
                dir: Some(sub),
            });
        }
    }

    dir
}

/// Generate the XML filelist for our own share, sorted by virtual path.
#[must_use]
pub fn generate_xml(share: &Share, store: &TthStore, cid: &str, generator: &str) -> String {
    #[derive(Default)]
    struct Node {
        dirs: BTreeMap<String, Node>,
        files: BTreeMap<String, (u64, Option<Tth>)>,
    }

    let mut root = Node::default();
    for (_, file) in share.hashed_files() {
        let Some(mp) = share.mount(file.mount) else {
            continue;
        };
        let mut node = root
            .dirs
            .entry(mp.virtual_root.clone())
            .or_default();

        let mut components: Vec<&str> = file.partial_path.split('/').collect();
        let name = components.pop().unwrap_or_default();
        for comp in components {
            node = node.dirs.entry(comp.to_string()).or_default();
        }
        node.files.insert(
            name.to_string(),
            (file.size, store.tth_by_inode(file.inode)),
        );
    }

    fn emit(node: &Node, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        for (name, child) in &node.dirs {
            out.push_str(&format!(
                "{indent}<Directory Name=\"{}\">\n",
                xml_escape(name)
            ));
            emit(child, depth + 1, out);
            out.push_str(&format!("{indent}</Directory>\n"));
        }
        for (name, (size, tth)) in &node.files {
            match tth {
                Some(tth) => out.push_str(&format!(
                    "{indent}<File Name=\"{}\" Size=\"{size}\" TTH=\"{tth}\"/>\n",
                    xml_escape(name)
                )),
                None => out.push_str(&format!(
                    "{indent}<File Name=\"{}\" Size=\"{size}\"/>\n",
                    xml_escape(name)
                )),
            }
        }
    }

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
    out.push_str(&format!(
        "<FileListing Version=\"1\" CID=\"{}\" Base=\"/\" Generator=\"{}\">\n",
        xml_escape(cid),
        xml_escape(generator)
    ));
    emit(&root, 0, &mut out);
    out.push_str("</FileListing>\n");
    out
}

/// Generate the legacy tab-indented list, Windows-1252 encoded
#[must_use]
pub fn generate_dclst(share: &Share) -> Vec<u8> {
    #[derive(Default)]
    struct Node {
        dirs: BTreeMap<String, Node>,
        files: BTreeMap<String, u64>,
    }

    let mut root = Node::default();
    for (_, file) in share.hashed_files() {
        let Some(mp) = share.mount(file.mount) else {
            continue;
        };
        let mut node = root
            .dirs
            .entry(mp.virtual_root.clone())
            .or_default();
        let mut components: Vec<&str> = file.partial_path.split('/').collect();
        let name = components.pop().unwrap_or_default();
        for comp in components {
            node = node.dirs.entry(comp.to_string()).or_default();
        }
        node.files.insert(name.to_string(), file.size);
    }

    fn emit(node: &Node, depth: usize, out: &mut String) {
        let indent = "\t".repeat(depth);
        for (name, child) in &node.dirs {
            out.push_str(&format!("{indent}{name}\r\n"));
            emit(child, depth + 1, out);
        }
        for (name, size) in &node.files {
            out.push_str(&format!("{indent}{name}|{size}\r\n"));
        }
    }

    let mut text = String::new();
    emit(&root, 0, &mut text);
    HubEncoding::default().encode_escaped(&text)
}

/// Write our filelist (and its bz2 companion) into the working directory.
///
/// # Errors
///
/// Fails with [`FilelistError::Io`] when writing fails.
pub fn save_own(
    share: &Share,
    store: &TthStore,
    workdir: &Path,
    cid: &str,
    generator: &str,
) -> Result<(), FilelistError> {
    let xml = generate_xml(share, store, cid, generator);
    let plain = workdir.join("files.xml");
    std::fs::write(&plain, &xml)?;

    let bz2_path = workdir.join("files.xml.bz2");
    let out = File::create(&bz2_path)?;
    let mut encoder = bzip2::write::BzEncoder::new(out, bzip2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    encoder.finish()?;

    std::fs::write(workdir.join("MyList.DcLst"), generate_dclst(share))?;
    Ok(())
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" CID="NOFUKZZSPMR4M" Base="/" Generator="DC++ 0.674">
<Directory Name="source">
  <Directory Name="directory">
    <File Name="filen" Size="26577" TTH="ABAJCAPSGKJMY7IFTZA7XSE2AINPGZYMHIWXVSY"/>
    <File Name="filen2" Size="1234567" TTH="ABAJCAPSGKJMY7IFTZA7XSE2AINPGZYMXXXXXXX"/>
      <Directory Name="subdir">
        <File Name="filen3" Size="2345678" TTH="ABAJCAPSGKJMY7IFTZA7XSE2AINPGZYMXXXZZZZ"/>
      </Directory>
  </Directory>
</Directory>
</FileListing>
"#;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("files.xml.bar");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_parse_xml_tree() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        let root = parse_xml(&path).unwrap();
        // 3 files + 3 directory entries
        assert_eq!(root.nfiles, 6);
        assert_eq!(root.size, 26577 + 1_234_567 + 2_345_678);

        let sub = root.find_directory("source\\directory").unwrap();
        assert_eq!(sub.nfiles, 4);
        let deeper = root.find_directory("source\\directory\\subdir").unwrap();
        assert_eq!(deeper.nfiles, 1);
        assert_eq!(deeper.size, 2_345_678);
    }

    #[test]
    fn test_each_leaf_paths() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let root = parse_xml(&path).unwrap();
        let sub = root.find_directory("source\\directory").unwrap();

        let mut seen = Vec::new();
        sub.each_leaf(&mut |path, file| {
            seen.push((path.to_string(), file.size));
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("source\\directory\\filen".to_string(), 26577),
                ("source\\directory\\filen2".to_string(), 1_234_567),
                ("source\\directory\\subdir\\filen3".to_string(), 2_345_678),
            ]
        );
    }

    #[test]
    fn test_parse_with_callback_streams_files() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);

        let mut count = 0;
        let mut total = 0;
        parse_with(&path, |path, _tth, size| {
            assert!(path.starts_with("source\\directory"));
            count += 1;
            total += size;
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(total, 26577 + 1_234_567 + 2_345_678);
    }

    #[test]
    fn test_bz2_unpack_and_cache() {
        let dir = TempDir::new().unwrap();
        let plain = write_sample(&dir);
        let compressed = dir.path().join("files.xml.bar.bz2");
        {
            let out = File::create(&compressed).unwrap();
            let mut enc = bzip2::write::BzEncoder::new(out, bzip2::Compression::default());
            enc.write_all(SAMPLE.as_bytes()).unwrap();
            enc.finish().unwrap();
        }
        std::fs::remove_file(&plain).unwrap();

        let unpacked = unpack(&compressed).unwrap();
        assert_eq!(unpacked, plain);
        let root = parse(&compressed).unwrap();
        assert_eq!(root.nfiles, 6);

        // a second unpack reuses the cache without rewriting it
        let meta_before = std::fs::metadata(&plain).unwrap().modified().unwrap();
        let again = unpack(&compressed).unwrap();
        assert_eq!(again, plain);
        assert_eq!(
            std::fs::metadata(&plain).unwrap().modified().unwrap(),
            meta_before
        );
    }

    #[test]
    fn test_dclst_decompression_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bar.DcLst");
        std::fs::write(&path, b"\x01\x02\x03").unwrap();
        assert!(matches!(
            unpack(&path),
            Err(FilelistError::Codec(_))
        ));
    }

    #[test]
    fn test_parse_dclst_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.txt");
        let mut f = File::create(&path).unwrap();
        // 0xE5 is 'å' in Windows-1252
        f.write_all(b"toppen\r\n\tsm\xE5|100\r\n\tsub\r\n\t\tdeep|200\r\n")
            .unwrap();

        let root = parse_dclst(&path).unwrap();
        assert_eq!(root.nfiles, 4);
        assert_eq!(root.size, 300);

        let top = root.find_directory("toppen").unwrap();
        assert_eq!(top.files[0].name, "sm\u{e5}");
        let sub = root.find_directory("toppen\\sub").unwrap();
        assert_eq!(sub.files[0].size, 200);
    }

    #[test]
    fn test_find_filelist_variants() {
        let dir = TempDir::new().unwrap();
        assert!(find_filelist(dir.path(), "bar").is_none());
        let path = write_sample(&dir);
        assert_eq!(find_filelist(dir.path(), "bar").unwrap(), path);
    }

    #[test]
    fn test_generated_xml_escapes_names() {
        let share = Share::new();
        let dir = TempDir::new().unwrap();
        let store = TthStore::open(dir.path().join("tth2.db")).unwrap();
        let xml = generate_xml(&share, &store, "CID", "puck 0.3 <&>");
        assert!(xml.contains("Generator=\"puck 0.3 &lt;&amp;&gt;\""));
        assert!(xml.contains("<FileListing Version=\"1\""));
    }
}
