// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The generic tree stream: a framed encoding of a directory tree used as
//! the driver-agnostic transfer payload for migration, as the backup
//! archive format, and as the local image archive format.
//!
//! Each entry is a length-delimited JSON header frame, followed by the raw
//! content bytes for regular files. A terminating `End` entry closes the
//! stream, so several trees can travel back-to-back on one connection.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path},
};

use serde::{Deserialize, Serialize};

use crate::{
    storage::{
        migration::{read_frame, write_frame, MigrationConn},
        types::Operation,
    },
    vessel::{VesselError, VesselResult},
};

const COPY_CHUNK: usize = 64 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EntryKind {
    Dir,
    File,
    Symlink,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryHeader {
    path: String,
    kind: EntryKind,
    mode: u32,
    size: u64,
    link_target: Option<String>,
}

fn end_header() -> EntryHeader {
    EntryHeader {
        path: String::new(),
        kind: EntryKind::End,
        mode: 0,
        size: 0,
        link_target: None,
    }
}

fn send_entry(conn: &mut dyn MigrationConn, header: &EntryHeader) -> VesselResult<()> {
    write_frame(conn, &serde_json::to_vec(header)?)
}

fn send_dir(root: &Path, rel: &Path, conn: &mut dyn MigrationConn, op: &Operation) -> VesselResult<()> {
    op.check_cancelled()?;

    let mut entries: Vec<_> = fs::read_dir(root.join(rel))?
        .collect::<Result<_, _>>()
        .map_err(VesselError::Io)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        let rel_str = rel_path.to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        let meta = entry.metadata()?;

        if file_type.is_dir() {
            send_entry(
                conn,
                &EntryHeader {
                    path: rel_str,
                    kind: EntryKind::Dir,
                    mode: meta.permissions().mode() & 0o7777,
                    size: 0,
                    link_target: None,
                },
            )?;
            send_dir(root, &rel_path, conn, op)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            send_entry(
                conn,
                &EntryHeader {
                    path: rel_str,
                    kind: EntryKind::Symlink,
                    mode: 0o777,
                    size: 0,
                    link_target: Some(target.to_string_lossy().into_owned()),
                },
            )?;
        } else {
            send_entry(
                conn,
                &EntryHeader {
                    path: rel_str,
                    kind: EntryKind::File,
                    mode: meta.permissions().mode() & 0o7777,
                    size: meta.len(),
                    link_target: None,
                },
            )?;

            let mut file = fs::File::open(entry.path())?;
            let mut remaining = meta.len();
            let mut buf = vec![0u8; COPY_CHUNK];
            while remaining > 0 {
                op.check_cancelled()?;
                let want = buf.len().min(remaining as usize);
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(VesselError::Msg(format!(
                        "File {} truncated while streaming",
                        entry.path().display()
                    )));
                }
                conn.write_all(&buf[..n])?;
                remaining -= n as u64;
            }
        }
    }

    Ok(())
}

/// Stream the tree rooted at `root` onto the connection, ending with a
/// terminator entry.
pub fn send_tree(root: &Path, conn: &mut dyn MigrationConn, op: &Operation) -> VesselResult<()> {
    send_dir(root, Path::new(""), conn, op)?;
    send_entry(conn, &end_header())?;
    conn.flush()?;
    Ok(())
}

fn safe_join(root: &Path, rel: &str) -> VesselResult<std::path::PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(VesselError::Msg(format!(
            "Refusing unsafe path {rel:?} in tree stream"
        )));
    }

    Ok(root.join(rel_path))
}

/// Receive one tree from the connection into `root`, which is created if
/// missing. Returns the number of file content bytes written.
pub fn recv_tree(conn: &mut dyn MigrationConn, root: &Path, op: &Operation) -> VesselResult<u64> {
    fs::create_dir_all(root)?;
    let mut total = 0u64;

    loop {
        op.check_cancelled()?;

        let header: EntryHeader = serde_json::from_slice(&read_frame(conn)?)?;
        match header.kind {
            EntryKind::End => return Ok(total),
            EntryKind::Dir => {
                let path = safe_join(root, &header.path)?;
                fs::create_dir_all(&path)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(header.mode))?;
            }
            EntryKind::Symlink => {
                let path = safe_join(root, &header.path)?;
                let target = header.link_target.ok_or_else(|| {
                    VesselError::Msg(format!("Symlink entry {:?} lacks a target", header.path))
                })?;
                if fs::symlink_metadata(&path).is_ok() {
                    fs::remove_file(&path)?;
                }
                symlink(&target, &path)?;
            }
            EntryKind::File => {
                let path = safe_join(root, &header.path)?;
                let mut file = fs::File::create(&path)?;
                let mut remaining = header.size;
                let mut buf = vec![0u8; COPY_CHUNK];
                while remaining > 0 {
                    op.check_cancelled()?;
                    let want = buf.len().min(remaining as usize);
                    conn.read_exact(&mut buf[..want]).map_err(io::Error::from)?;
                    file.write_all(&buf[..want])?;
                    remaining -= want as u64;
                }
                file.flush()?;
                fs::set_permissions(&path, fs::Permissions::from_mode(header.mode))?;
                total += header.size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::storage::structures::{pipe_pair, Cancel};

    use super::*;

    #[test]
    /// A tree survives the stream byte for byte, including back-to-back
    /// trees on one connection.
    fn tree_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::create_dir(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/data"), vec![7u8; 100_000]).unwrap();
        fs::write(src.path().join("top"), b"small").unwrap();
        symlink("top", src.path().join("link")).unwrap();

        let cancel = Cancel::new();
        let (mut a, mut b) = pipe_pair(&cancel);
        let src_path = src.path().to_path_buf();

        let sender = thread::spawn(move || {
            let op = Operation::new();
            send_tree(&src_path, &mut a, &op)?;
            send_tree(&src_path, &mut a, &op)
        });

        let op = Operation::new();
        let first = recv_tree(&mut b, &dst.path().join("one"), &op).unwrap();
        let second = recv_tree(&mut b, &dst.path().join("two"), &op).unwrap();
        sender.join().unwrap().unwrap();

        assert_eq!(first, 100_005);
        assert_eq!(first, second);
        assert_eq!(
            fs::read(dst.path().join("one/nested/data")).unwrap(),
            vec![7u8; 100_000]
        );
        assert_eq!(
            fs::read_link(dst.path().join("two/link")).unwrap(),
            Path::new("top")
        );
    }

    #[test]
    /// Parent-directory escapes in a stream are rejected.
    fn rejects_path_escape() {
        let root = tempfile::tempdir().unwrap();
        assert_matches!(
            safe_join(root.path(), "../outside"),
            Err(VesselError::Msg(_))
        );
        assert_matches!(safe_join(root.path(), "/abs"), Err(VesselError::Msg(_)));
    }
}
