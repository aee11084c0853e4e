//! File plumbing for the datastore: creating and growing backing
//! files, and copying them while preserving sparseness.
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use log::debug;
use log::warn;

/// Creates `path` if it does not exist.  Never truncates.
pub fn create_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

/// Grows `file` to `size` bytes.  Shrinking is never requested.
pub fn extend_file(file: &File, size: u64) -> io::Result<()> {
    let current = file.metadata()?.len();
    if current < size {
        file.set_len(size)?;
    }
    Ok(())
}

/// Returns the size of the file at `path`.
pub fn file_size(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Copies `src` to `dst`, preserving holes.  Tries a reflink first;
/// when the filesystem cannot share extents, walks the data segments
/// of `src` with `SEEK_DATA`/`SEEK_HOLE` and copies only those,
/// leaving holes in `dst`.
pub fn clone_file(src: &Path, dst: &Path) -> io::Result<()> {
    let src_file = File::open(src)?;
    let dst_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;

    #[cfg(target_os = "linux")]
    {
        if reflink(&src_file, &dst_file).is_ok() {
            debug!("Cloned {} by reflink", src.display());
            return Ok(());
        }
    }

    copy_sparse(&src_file, &dst_file).or_else(|error| {
        // SEEK_DATA is filesystem dependent; fall back to a dense copy.
        warn!(
            "Sparse copy of {} failed ({}); falling back to a dense copy",
            src.display(),
            error
        );
        std::fs::copy(src, dst).map(|_| ())
    })
}

#[cfg(target_os = "linux")]
fn reflink(src: &File, dst: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // FICLONE is _IOW(0x94, 9, int).
    const FICLONE: libc::c_ulong = 0x40049409;

    let ret = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE, src.as_raw_fd()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Copies only the data segments of `src`, punching the interleaving
/// holes into `dst`.
fn copy_sparse(src: &File, dst: &File) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::AsRawFd;

    let len = src.metadata()?.len();
    dst.set_len(len)?;

    let mut buf = vec![0u8; 1 << 20];
    let mut offset: u64 = 0;

    while offset < len {
        let data_begin = match seek_to(src.as_raw_fd(), offset, libc::SEEK_DATA) {
            Ok(pos) => pos.min(len),
            // ENXIO: no data segment after `offset`; the rest is hole.
            Err(errno) if errno == libc::ENXIO => break,
            Err(errno) => return Err(io::Error::from_raw_os_error(errno)),
        };
        let data_end = seek_to(src.as_raw_fd(), data_begin, libc::SEEK_HOLE)
            .map_err(io::Error::from_raw_os_error)?
            .min(len);

        let mut pos = data_begin;
        while pos < data_end {
            let want = buf.len().min((data_end - pos) as usize);
            let got = src.read_at(&mut buf[..want], pos)?;
            if got == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source file shrank during copy"));
            }
            dst.write_at(&buf[..got], pos)?;
            pos += got as u64;
        }

        offset = data_end;
    }

    Ok(())
}

fn seek_to(fd: std::os::unix::io::RawFd, offset: u64, whence: i32) -> Result<u64, i32> {
    let ret = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if ret < 0 {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    } else {
        Ok(ret as u64)
    }
}

/// Copies every regular file directly under `src` into `dst`,
/// preserving sparseness.  Subdirectories are recreated and descended
/// into.
pub fn copy_directory_contents(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_directory_contents(&entry.path(), &target)?;
        } else {
            clone_file(&entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    #[test]
    fn clone_preserves_contents() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        std::fs::write(&src, b"hello sparse world").expect("write should succeed");
        clone_file(&src, &dst).expect("clone should succeed");

        assert_eq!(std::fs::read(&dst).expect("read should succeed"), b"hello sparse world");
    }

    #[test]
    fn clone_preserves_length_of_sparse_file() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        let mut file = create_file(&src).expect("create should succeed");
        file.seek(SeekFrom::Start(1 << 20)).expect("seek should succeed");
        file.write_all(b"tail").expect("write should succeed");
        drop(file);

        clone_file(&src, &dst).expect("clone should succeed");

        assert_eq!(
            file_size(&dst).expect("size should succeed"),
            (1 << 20) + 4,
            "logical length must round-trip"
        );
        let copied = std::fs::read(&dst).expect("read should succeed");
        assert_eq!(&copied[1 << 20..], b"tail");
        assert!(copied[..1 << 20].iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_directory_recurses() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let src = dir.path().join("a");
        let dst = dir.path().join("b");

        std::fs::create_dir_all(src.join("nested")).expect("mkdir should succeed");
        std::fs::write(src.join("top"), b"1").expect("write should succeed");
        std::fs::write(src.join("nested").join("leaf"), b"2").expect("write should succeed");

        copy_directory_contents(&src, &dst).expect("copy should succeed");

        assert_eq!(std::fs::read(dst.join("top")).expect("read"), b"1");
        assert_eq!(std::fs::read(dst.join("nested").join("leaf")).expect("read"), b"2");
    }
}
