//! Disposable staging area that becomes the jail's filesystem root.
//!
//! Each run gets a fresh, uniquely named directory under the configured
//! staging root holding a single copy of the target executable named
//! [`PROGRAM_NAME`]. Ownership is handed to the low-privilege identity only
//! after the copy is complete, so that identity never sees a partial file.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::{Context, Error, Result};
use crate::identity::Identity;

/// File name of the staged executable inside the jail.
pub const PROGRAM_NAME: &str = "program";

/// Mode of the staging directory: traversable by the jailed identity.
const DIR_MODE: u32 = 0o777;

/// Mode of the staged executable: readable and executable, never rewritten.
const PROGRAM_MODE: u32 = 0o555;

/// Copy buffer size.
const COPY_BUF: usize = 4096;

/// A staged copy of the target executable in its own directory.
#[derive(Debug)]
pub struct StagingArea {
    /// The directory; removed by [`StagingArea::remove`].
    dir: TempDir,
    /// Absolute path of the staged executable.
    program: PathBuf,
}

impl StagingArea {
    /// Creates a staging directory under `root` and copies `source` into it.
    ///
    /// The directory name is `<user>.XXXXXX` with a random suffix. On any
    /// failure the partially built directory is removed before returning.
    /// `root` is rejected up front unless `owner` can remove entries from it.
    pub fn create(root: &Path, source: &Path, owner: &Identity) -> Result<Self> {
        check_root(root, owner)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", owner.name))
            .rand_bytes(6)
            .tempdir_in(root)
            .context("create staging directory")?;
        let program = dir.path().join(PROGRAM_NAME);

        stage_program(source, &program)?;

        let uid = Some(owner.uid.as_raw());
        let gid = Some(owner.gid.as_raw());
        std::os::unix::fs::chown(dir.path(), uid, gid).context("chown staging directory")?;
        fs::set_permissions(dir.path(), Permissions::from_mode(DIR_MODE))
            .context("chmod staging directory")?;
        std::os::unix::fs::chown(&program, uid, gid).context("chown staged program")?;
        fs::set_permissions(&program, Permissions::from_mode(PROGRAM_MODE))
            .context("chmod staged program")?;

        debug!(path = %dir.path().display(), "staging area ready");
        Ok(Self { dir, program })
    }

    /// Path of the staging directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the staged executable on the host.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Recursively deletes the staging directory.
    ///
    /// Unlike dropping, removal failures are reported.
    pub fn remove(self) -> Result<()> {
        let path = self.dir.path().to_owned();
        self.dir.close().context("remove staging directory")?;
        debug!(path = %path.display(), "staging area removed");
        Ok(())
    }
}

/// Fails unless `owner` has write and search permission on `root`, which is
/// what unlinking its staging directory needs once privileges are dropped.
fn check_root(root: &Path, owner: &Identity) -> Result<()> {
    let meta = fs::metadata(root).context("stat staging root")?;
    if !meta.is_dir() {
        return Err(Error::Config(format!(
            "staging root {} is not a directory",
            root.display()
        )));
    }
    let mode = meta.mode();
    let writable = if meta.uid() == owner.uid.as_raw() {
        mode & 0o300 == 0o300
    } else if meta.gid() == owner.gid.as_raw() {
        mode & 0o030 == 0o030
    } else {
        mode & 0o003 == 0o003
    };
    if !writable {
        return Err(Error::Config(format!(
            "staging root {} (mode {:o}) is not writable by {}",
            root.display(),
            mode & 0o7777,
            owner.name
        )));
    }
    Ok(())
}

/// Copies `source` to a newly created file at `dest`.
fn stage_program(source: &Path, dest: &Path) -> Result<()> {
    let mut from = File::open(source).context("open program")?;
    let mut to = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PROGRAM_MODE)
        .open(dest)
        .context("create staged program")?;
    let copied = copy_all(&mut from, &mut to).context("copy program")?;
    to.sync_all().context("sync staged program")?;
    debug!(bytes = copied, "program copied");
    Ok(())
}

/// Copies every byte from `r` to `w`, retrying interrupted calls and
/// finishing partial writes. Returns the number of bytes copied.
pub(crate) fn copy_all<R: Read + ?Sized, W: Write + ?Sized>(r: &mut R, w: &mut W) -> io::Result<u64> {
    let mut buf = [0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let mut chunk = &buf[..n];
        while !chunk.is_empty() {
            match w.write(chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => chunk = &chunk[written..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        total += n as u64;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Reader that yields `Interrupted` before every real read.
    struct Flaky<R> {
        inner: R,
        interrupt: bool,
    }

    impl<R: Read> Read for Flaky<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }
    }

    /// Writer that accepts at most 7 bytes per call and interrupts every
    /// other call.
    #[derive(Default)]
    struct Trickle {
        data: Vec<u8>,
        calls: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(7);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn copy_survives_partial_and_interrupted_calls() {
        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut r = Flaky {
            inner: io::Cursor::new(input.clone()),
            interrupt: false,
        };
        let mut w = Trickle::default();
        let n = copy_all(&mut r, &mut w).unwrap();
        assert_eq!(n, input.len() as u64);
        assert_eq!(w.data, input);
    }

    #[test]
    fn copy_propagates_real_errors() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::StorageFull.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = copy_all(&mut io::Cursor::new(b"abc".to_vec()), &mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
    }

    #[test]
    fn create_copies_program_and_sets_modes() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src.bin");
        fs::write(&src, b"\x7fELF fake program").unwrap();
        let me = Identity::current();

        let area = StagingArea::create(root.path(), &src, &me).unwrap();
        let name = area.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("{}.", me.name)));
        assert_eq!(fs::read(area.program()).unwrap(), b"\x7fELF fake program");

        let dir_meta = fs::metadata(area.path()).unwrap();
        assert_eq!(dir_meta.mode() & 0o777, DIR_MODE);
        assert_eq!(dir_meta.uid(), me.uid.as_raw());
        let file_meta = fs::metadata(area.program()).unwrap();
        assert_eq!(file_meta.mode() & 0o777, PROGRAM_MODE);

        let path = area.path().to_owned();
        area.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sequential_areas_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src.bin");
        fs::write(&src, b"x").unwrap();
        let me = Identity::current();

        let a = StagingArea::create(root.path(), &src, &me).unwrap();
        let a_path = a.path().to_owned();
        a.remove().unwrap();
        let b = StagingArea::create(root.path(), &src, &me).unwrap();
        assert_ne!(a_path, b.path());
        b.remove().unwrap();
    }

    #[test]
    fn missing_source_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let err = StagingArea::create(root.path(), &root.path().join("nope"), &Identity::current());
        assert!(err.is_err());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn root_the_owner_cannot_write_is_rejected_before_creating_anything() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src.bin");
        fs::write(&src, b"x").unwrap();
        let locked = root.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, Permissions::from_mode(0o555)).unwrap();

        let err = StagingArea::create(&locked, &src, &Identity::current()).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert_eq!(fs::read_dir(&locked).unwrap().count(), 0);
    }

    #[test]
    fn world_writable_sticky_root_is_accepted_for_other_accounts() {
        let root = tempfile::tempdir().unwrap();
        fs::set_permissions(root.path(), Permissions::from_mode(0o1777)).unwrap();
        let stranger = Identity {
            uid: nix::unistd::Uid::from_raw(u32::MAX - 1),
            gid: nix::unistd::Gid::from_raw(u32::MAX - 1),
            ..Identity::current()
        };
        check_root(root.path(), &stranger).unwrap();

        fs::set_permissions(root.path(), Permissions::from_mode(0o755)).unwrap();
        assert!(check_root(root.path(), &stranger).is_err());
    }
}
