//! End-to-end file-system scenarios over an in-memory disk: basic
//! integrity, crash-stage recovery, path resolution and fd refcounts.

mod common;

use common::*;
use kernel::file::{FileKind, FileTable};
use kernel::fs::{InodeType, BSIZE, ROOTINO};

#[test]
fn s1_integrity_create_write_read_unlink() {
    let fs = fresh_fs();
    let msg = b"Hello, filesystem!";

    // create foo and write the message
    fs.begin_transaction();
    let ip = create_in_root(&fs, b"foo", InodeType::File);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, msg);
    }
    fs.iput(ip);
    fs.end_transaction();

    // reopen by path and read it back
    fs.begin_transaction();
    let ip = fs.namei(b"/foo").expect("foo exists");
    {
        let mut g = fs.ilock(ip);
        assert_eq!(g.size, msg.len() as u32);
        let mut back = [0u8; 18];
        assert_eq!(read_exact(&fs, &mut g, 0, &mut back), 18);
        assert_eq!(&back, msg);
    }
    fs.iput(ip);
    fs.end_transaction();

    // unlink succeeds; a subsequent open fails
    fs.begin_transaction();
    assert!(unlink_in_root(&fs, b"foo").is_ok());
    fs.end_transaction();

    fs.begin_transaction();
    assert!(fs.namei(b"/foo").is_none());
    fs.end_transaction();
}

#[test]
fn s2_crash_at_commit_point_redoes_transaction() {
    let fs = fresh_fs();
    let msg = b"journal-data";

    // stop right after the commit record is on disk
    fs.log.set_crash_stage(1);
    fs.begin_transaction();
    let ip = create_in_root(&fs, b"bar", InodeType::File);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, msg);
    }
    fs.iput(ip);
    fs.end_transaction();
    fs.log.set_crash_stage(0);

    // "crash": lose the cache, then recover from the log
    fs.cache.clear_cache();
    fs.log.recover(&fs.cache);

    fs.begin_transaction();
    let ip = fs.namei(b"/bar").expect("bar must survive recovery");
    {
        let mut g = fs.ilock(ip);
        let mut back = vec![0u8; msg.len()];
        assert_eq!(read_exact(&fs, &mut g, 0, &mut back), msg.len() as u32);
        assert_eq!(&back[..], msg);
    }
    fs.iput(ip);
    fs.end_transaction();
}

#[test]
fn s3_crash_before_commit_point_aborts_transaction() {
    let fs = fresh_fs();

    // stop after the log body is staged but before the commit record
    fs.log.set_crash_stage(2);
    fs.begin_transaction();
    let ip = create_in_root(&fs, b"baz", InodeType::File);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, b"journal-data");
    }
    fs.iput(ip);
    fs.end_transaction();
    fs.log.set_crash_stage(0);

    fs.cache.clear_cache();
    fs.log.recover(&fs.cache);

    // the transaction must have left no trace
    fs.begin_transaction();
    assert!(fs.namei(b"/baz").is_none());
    fs.end_transaction();
}

#[test]
fn s4_concurrent_writers_leave_no_files_behind() {
    let fs = fresh_fs();

    std::thread::scope(|s| {
        for t in 0..4u32 {
            let fs = &fs;
            s.spawn(move || {
                let name = [b'w', b'0' + t as u8];
                let data = [t as u8; 512];
                for _ in 0..50 {
                    fs.begin_transaction();
                    let ip = create_in_root(fs, &name, InodeType::File);
                    {
                        let mut g = fs.ilock(ip);
                        write_all(fs, &mut g, 0, &data);
                        let mut back = [0u8; 512];
                        assert_eq!(read_exact(fs, &mut g, 0, &mut back), 512);
                        assert_eq!(back, data);
                    }
                    fs.iput(ip);
                    fs.end_transaction();

                    fs.begin_transaction();
                    unlink_in_root(fs, &name).unwrap();
                    fs.end_transaction();
                }
            });
        }
    });

    // all files gone at the end
    fs.begin_transaction();
    for t in 0..4u32 {
        let name = [b'w', b'0' + t as u8];
        assert!(fs.namei(&name).is_none());
    }
    fs.end_transaction();

    // and nothing leaked a buffer reference
    assert_eq!(fs.cache.buffers_in_use(), 0);
}

#[test]
fn resolver_fixed_point_dotdot() {
    let fs = fresh_fs();

    fs.begin_transaction();
    let root = fs.iget(DEV, ROOTINO);
    let a = create_at(&fs, root, b"a", InodeType::Dir);
    let _b = create_at(&fs, a, b"b", InodeType::Dir);
    let c = create_at(&fs, root, b"c", InodeType::File);
    fs.iput(root);
    fs.end_transaction();

    fs.begin_transaction();
    let via = fs.namei(b"/a/b/../../c").expect("path resolves");
    let direct = fs.namei(b"/a/../c").expect("path resolves");
    assert_eq!(via.inum, c.inum);
    assert_eq!(direct.inum, c.inum);
    fs.iput(via);
    fs.iput(direct);
    fs.end_transaction();
}

#[test]
fn symlink_chain_resolves_up_to_depth_bound() {
    let fs = fresh_fs();

    fs.begin_transaction();
    let _real = create_in_root(&fs, b"real", InodeType::File);

    // link7 -> ... -> link0 -> /real: 8 expansions, exactly at the bound.
    let mut target: Vec<u8> = b"/real".to_vec();
    for i in 0..8u8 {
        let name = [b'l', b'0' + i];
        let ip = create_in_root(&fs, &name, InodeType::Symlink);
        let mut g = fs.ilock(ip);
        let mut body = target.clone();
        body.push(0);
        write_all(&fs, &mut g, 0, &body);
        fs.iunlockput(g, ip);
        target = [b"/".as_slice(), name.as_slice()].concat();
    }
    fs.end_transaction();

    // l7 is 8 links deep: still fine.
    fs.begin_transaction();
    let ip = fs.namei(b"/l7").expect("8 levels resolve");
    {
        let g = fs.ilock(ip);
        assert_eq!(g.typ, InodeType::File);
    }
    fs.iput(ip);
    fs.end_transaction();

    // one more hop exceeds the bound and must fail cleanly.
    fs.begin_transaction();
    let ip = create_in_root(&fs, b"l8", InodeType::Symlink);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, b"/l7\0");
    }
    fs.iput(ip);
    fs.end_transaction();

    fs.begin_transaction();
    assert!(fs.namei(b"/l8").is_none());
    fs.end_transaction();
}

#[test]
fn fd_refcounts_release_inode_exactly_once() {
    let fs = fresh_fs();
    let ft = FileTable::new();

    fs.begin_transaction();
    let ip = create_in_root(&fs, b"shared", InodeType::File);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, b"payload");
    }
    fs.end_transaction();

    let f = ft.alloc(FileKind::Inode(ip), true, false).unwrap();
    let dup1 = ft.dup(f);
    let dup2 = ft.dup(f);
    assert_eq!(ft.refcount(f), 3);

    // interleave reads through the duplicates: one shared offset.
    let mut buf = [0u8; 3];
    assert_eq!(ft.read(dup1, &fs, false, buf.as_mut_ptr() as usize, 3), Ok(3));
    assert_eq!(&buf, b"pay");
    assert_eq!(ft.read(dup2, &fs, false, buf.as_mut_ptr() as usize, 3), Ok(3));
    assert_eq!(&buf, b"loa");

    ft.close(dup1, &fs);
    ft.close(dup2, &fs);
    assert_eq!(ft.refcount(f), 1);
    ft.close(f, &fs);
    assert_eq!(ft.refcount(f), 0);

    // the name still resolves (nlink is 1); the file table reference is
    // gone but the file survives.
    fs.begin_transaction();
    let again = fs.namei(b"/shared").expect("still linked");
    fs.iput(again);
    fs.end_transaction();
}

#[test]
fn unlinked_open_file_is_freed_on_close() {
    let fs = fresh_fs();
    let ft = FileTable::new();

    fs.begin_transaction();
    let ip = create_in_root(&fs, b"tmp", InodeType::File);
    {
        let mut g = fs.ilock(ip);
        write_all(&fs, &mut g, 0, &[7u8; 2 * BSIZE]);
    }
    fs.end_transaction();

    let f = ft.alloc(FileKind::Inode(ip), true, true).unwrap();

    // unlink while open: the inode lives on until the last close.
    fs.begin_transaction();
    unlink_in_root(&fs, b"tmp").unwrap();
    fs.end_transaction();

    let mut buf = [0u8; 16];
    assert_eq!(ft.read(f, &fs, false, buf.as_mut_ptr() as usize, 16), Ok(16));
    assert!(buf.iter().all(|&b| b == 7));

    // last close truncates and frees the on-disk inode.
    ft.close(f, &fs);

    fs.begin_transaction();
    assert!(fs.namei(b"/tmp").is_none());
    fs.end_transaction();
}
