mod common;

use common::{setup, small_geometry};
use std::sync::{Arc, Mutex};
use tg_ffs::{CharDevice, FsError, InodeType, OpenFlags, ROOT_INODE_NO};

#[test]
fn new_directory_has_dot_entries() {
    let (_, fs) = setup(small_geometry());
    assert_eq!(fs.readdir("/", None).unwrap(), [".", ".."]);
    fs.mkdir("/a", None).unwrap();

    assert_eq!(fs.readdir("/a", None).unwrap(), [".", ".."]);
    let a = fs.stat("/a", None).unwrap();
    assert_eq!(a.kind, InodeType::Directory);
    assert_eq!(a.nlink, 1);
    assert_eq!(fs.stat("/a/.", None).unwrap().ino, a.ino);
    assert_eq!(fs.stat("/a/..", None).unwrap().ino, ROOT_INODE_NO);
    assert_eq!(fs.stat("/", None).unwrap().nlink, 2);
    assert_eq!(fs.readdir("/", None).unwrap(), [".", "..", "a"]);
}

#[test]
fn relative_paths_follow_cwd() {
    let (_, fs) = setup(small_geometry());
    fs.mkdir("/a", None).unwrap();
    fs.mkdir("a/b", None).unwrap();
    let cwd = fs.chdir("/a", None).unwrap();
    assert_eq!(fs.stat("b", Some(&cwd)).unwrap(), fs.stat("/a/b", None).unwrap());
    assert_eq!(fs.stat("../a/./b", Some(&cwd)).unwrap().ino, fs.stat("/a/b", None).unwrap().ino);
    assert_eq!(fs.chdir("/a/b/c", None).err(), Some(FsError::NotFound));
    fs.release(cwd);
}

#[test]
fn unlink_refuses_bad_targets() {
    let (_, fs) = setup(small_geometry());
    fs.mkdir("/a", None).unwrap();
    drop(fs.open_file("/a/f", OpenFlags::CREATE, None).unwrap());

    assert_eq!(fs.unlink("/a", None), Err(FsError::DirectoryNotEmpty));
    assert_eq!(fs.unlink("/a/.", None), Err(FsError::InvalidName));
    assert_eq!(fs.unlink("/a/..", None), Err(FsError::InvalidName));
    assert_eq!(fs.unlink("/a/missing", None), Err(FsError::NotFound));
    assert_eq!(fs.readdir("/a", None).unwrap(), [".", "..", "f"]);
    assert_eq!(fs.stat("/", None).unwrap().nlink, 2);

    fs.unlink("/a/f", None).unwrap();
    fs.unlink("/a", None).unwrap();
    assert_eq!(fs.stat("/", None).unwrap().nlink, 1);
    assert_eq!(fs.readdir("/", None).unwrap(), [".", ".."]);
    assert_eq!(fs.inodes().live_count(), 1);
}

#[test]
fn freed_slot_is_reused() {
    let (_, fs) = setup(small_geometry());
    for name in ["/x", "/y", "/z"] {
        drop(fs.open_file(name, OpenFlags::CREATE, None).unwrap());
    }
    fs.unlink("/y", None).unwrap();
    drop(fs.open_file("/w", OpenFlags::CREATE, None).unwrap());
    assert_eq!(fs.readdir("/", None).unwrap(), [".", "..", "x", "w", "z"]);
}

#[test]
fn create_existing_name() {
    let (_, fs) = setup(small_geometry());
    let first = fs.open_file("/f", OpenFlags::CREATE, None).unwrap().stat();
    let again = fs.open_file("/f", OpenFlags::CREATE | OpenFlags::RDWR, None).unwrap().stat();
    assert_eq!(first.ino, again.ino);

    assert_eq!(fs.mkdir("/f", None), Err(FsError::AlreadyExists));
    assert_eq!(fs.mknod("/f", 1, 0, None), Err(FsError::AlreadyExists));
    fs.mkdir("/d", None).unwrap();
    assert_eq!(fs.mkdir("/d", None), Err(FsError::AlreadyExists));
    assert_eq!(
        fs.open_file("/d", OpenFlags::CREATE, None).err(),
        Some(FsError::AlreadyExists)
    );
    assert_eq!(fs.open_file("/d", OpenFlags::RDWR, None).err(), Some(FsError::IsDirectory));
    assert_eq!(fs.inodes().live_count(), 1);
}

#[test]
fn lookup_through_file_fails() {
    let (_, fs) = setup(small_geometry());
    drop(fs.open_file("/f", OpenFlags::CREATE, None).unwrap());
    assert_eq!(fs.stat("/f/x", None), Err(FsError::NotFound));
    assert_eq!(fs.mkdir("/f/x", None), Err(FsError::NotFound));
    assert_eq!(fs.mkdir("/nope/x", None), Err(FsError::NotFound));
    assert_eq!(fs.mkdir("/", None), Err(FsError::NotFound));
}

#[test]
fn long_names_are_truncated() {
    let (_, fs) = setup(small_geometry());
    drop(fs.open_file("/abcdefghijklmnopqrst", OpenFlags::CREATE, None).unwrap());
    let short = fs.stat("/abcdefghijklmn", None).unwrap();
    let long = fs.stat("/abcdefghijklmnXYZ", None).unwrap();
    assert_eq!(short.ino, long.ino);
    assert_eq!(fs.readdir("/", None).unwrap()[2], "abcdefghijklmn");
}

#[test]
fn top_level_directories_balance_groups() {
    let (_, fs) = setup(small_geometry());
    let cache = fs.cache();
    let mut seen = Vec::new();
    for i in 0..4 {
        let emptiest = (0..4).min_by_key(|&g| cache.used_blocks(g)).unwrap();
        let path = format!("/d{i}");
        fs.mkdir(&path, None).unwrap();
        let group = fs.inodes().group_of(fs.stat(&path, None).unwrap().ino);
        assert_eq!(group, emptiest);
        seen.push(group);
    }
    // the root directory already uses a block of group 0
    assert_eq!(seen, [1, 2, 3, 0]);

    // regular files stay with their parent
    fs.open_file("/d0/f", OpenFlags::CREATE, None).unwrap();
    let ino = fs.stat("/d0/f", None).unwrap().ino;
    assert_eq!(fs.inodes().group_of(ino), 1);
}

#[test]
fn hard_links() {
    let (_, fs) = setup(small_geometry());
    let file = fs.open_file("/f", OpenFlags::CREATE | OpenFlags::RDWR, None).unwrap();
    file.write(b"shared").unwrap();
    fs.link("/f", "/g", None).unwrap();
    let f = fs.stat("/f", None).unwrap();
    let g = fs.stat("/g", None).unwrap();
    assert_eq!(f.ino, g.ino);
    assert_eq!(g.nlink, 2);

    fs.mkdir("/d", None).unwrap();
    assert_eq!(fs.link("/d", "/e", None), Err(FsError::CrossLinkDirectory));
    assert_eq!(fs.link("/f", "/g", None), Err(FsError::AlreadyExists));
    assert_eq!(fs.link("/f", "/missing/g", None), Err(FsError::NotFound));
    assert_eq!(fs.stat("/f", None).unwrap().nlink, 2);

    fs.unlink("/f", None).unwrap();
    let reopened = fs.open_file("/g", OpenFlags::RDONLY, None).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reopened.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"shared");
    assert_eq!(reopened.stat().nlink, 1);
    drop(file);
}

#[derive(Default)]
struct Console {
    output: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl CharDevice for Console {
    fn read(&self, minor: u16, buf: &mut [u8]) -> usize {
        buf.fill(b'0' + minor as u8);
        buf.len()
    }

    fn write(&self, minor: u16, buf: &[u8]) -> usize {
        self.output.lock().unwrap().push((minor, buf.to_vec()));
        buf.len()
    }
}

#[test]
fn device_files_reach_their_driver() {
    let (_, fs) = setup(small_geometry());
    let console = Arc::new(Console::default());
    fs.register_device(1, console.clone());
    fs.mknod("/console", 1, 3, None).unwrap();
    fs.mknod("/null", 9, 0, None).unwrap();
    assert_eq!(fs.stat("/console", None).unwrap().kind, InodeType::Device);

    let tty = fs.open_file("/console", OpenFlags::RDWR, None).unwrap();
    assert_eq!(tty.write(b"hi").unwrap(), 2);
    let mut buf = [0u8; 4];
    assert_eq!(tty.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"3333");
    assert_eq!(*console.output.lock().unwrap(), [(3, b"hi".to_vec())]);
    assert_eq!(tty.stat().size, 0);

    let null = fs.open_file("/null", OpenFlags::WRONLY, None).unwrap();
    assert_eq!(null.write(b"x"), Err(FsError::NoDevice));
}
