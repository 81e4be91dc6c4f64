//! Shared helpers for the workspace integration tests.

use std::path::{Path, PathBuf};

use puck_hash::Tth;
use puck_share::{walk_mountpoint, Share, TthStore};
use tempfile::TempDir;

/// A share rooted in a temp directory with every file hashed
pub struct ShareFixture {
    /// Keeps the directory alive
    pub dir: TempDir,
    /// The mount root
    pub root: PathBuf,
    /// The populated share
    pub share: Share,
    /// Its TTH store
    pub store: TthStore,
}

/// Build a share containing `files` as `(relative_path, size_bytes)`,
/// each hashed with a synthetic distinct TTH.
#[must_use]
pub fn populated_share(files: &[(&str, usize)]) -> ShareFixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("media");

    for (relative, size) in files {
        let path = root.join(relative.replace('\\', "/"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0x5Au8; *size]).unwrap();
    }

    let mut store = TthStore::open(dir.path().join("tth2.db")).unwrap();
    let mut share = Share::new();
    let id = share.add_mountpoint(&root).unwrap();
    share.begin_scan(id);
    let scanned = walk_mountpoint(&root).unwrap();
    share.apply_scan(id, scanned, &mut store).unwrap();

    for (i, (relative, _)) in files.iter().enumerate() {
        let path = root.join(relative.replace('\\', "/"));
        let tth = synthetic_tth(u8::try_from(i + 1).unwrap());
        share
            .on_tth_available(
                &path,
                Some((tth, "QUJDREVGR0hJSktMTU5PUFFSU1RVVlc=", 1000)),
                &mut store,
            )
            .unwrap();
    }

    ShareFixture {
        dir,
        root,
        share,
        store,
    }
}

/// A deterministic, obviously fake TTH
#[must_use]
pub fn synthetic_tth(n: u8) -> Tth {
    Tth::from_digest([n; 24])
}

/// Write a small XML filelist for nick `bar` into `workdir`
pub fn write_bar_filelist(workdir: &Path) -> PathBuf {
    let content = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
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
    let path = workdir.join("files.xml.bar");
    std::fs::write(&path, content).unwrap();
    path
}
