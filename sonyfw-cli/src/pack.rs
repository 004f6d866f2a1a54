//! `pack-cramfs`: stages a real directory tree into cramfs [`StagedFile`]
//! records and runs it through [`sonyfw::fs::cramfs::write_cramfs`].

use anyhow::{Context, Result};
use sonyfw::fs::cramfs::{self, StagedFile};
use sonyfw::fs::{S_IFDIR, S_IFREG};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

fn walk(root: &Path, rel: &str, out: &mut Vec<StagedFile>) -> Result<()> {
    for entry in fs::read_dir(root.join(rel.trim_start_matches('/')))
        .with_context(|| format!("reading directory {rel}"))?
    {
        let entry = entry?;
        let meta = entry.metadata()?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = format!("{}/{name}", rel.trim_end_matches('/'));

        if meta.is_dir() {
            out.push(StagedFile {
                path: path.clone(),
                mode: S_IFDIR | 0o755,
                uid: meta.uid(),
                gid: meta.gid(),
                data: Vec::new(),
            });
            walk(root, &path, out)?;
        } else if meta.is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            out.push(StagedFile {
                path,
                mode: S_IFREG | (meta.mode() & 0o7777),
                uid: meta.uid(),
                gid: meta.gid(),
                data,
            });
        }
        // Symlinks and other special files are skipped; the writer's
        // StagedFile has no slot for a link target.
    }
    Ok(())
}

pub fn cmd_pack_cramfs(dir: &Path, out: &Path) -> Result<()> {
    let mut staged = Vec::new();
    walk(dir, "", &mut staged)?;
    println!("staged {} entries from {}", staged.len(), dir.display());

    let image = cramfs::write_cramfs(&staged).context("writing cramfs image")?;
    fs::write(out, &image).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} bytes to {}", image.len(), out.display());
    Ok(())
}
