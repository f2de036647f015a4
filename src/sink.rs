//! Sink adapters: a filesystem sink (open/append/rename/fsync/free-space)
//! and a callback sink (user-supplied byte consumer), behind the minimal
//! `write` interface the flusher depends on.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;

/// The minimal interface the flusher needs from any sink.
pub trait Sink {
    /// Writes `data` to the sink, retrying on transient errors and
    /// advancing across partial writes. Returns `Err` only on a
    /// non-transient failure; the caller stops writing for the rest of
    /// the run in that case.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Generates a random 16-hex-digit filename with the `wpilog_` prefix and
/// `.wpilog` suffix.
#[must_use]
pub fn make_random_filename() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut name = String::from("wpilog_");
    for _ in 0..16 {
        let idx = rng.gen_range(0..HEX.len());
        name.push(HEX[idx] as char);
    }
    name.push_str(".wpilog");
    name
}

/// Writes `data` to `file`, retrying on `Interrupted`/`WouldBlock` and
/// advancing across partial writes. Stops and returns the error on the
/// first non-transient failure.
fn write_retrying(file: &mut File, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "wrote zero bytes"));
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// A file-backed sink: opens (or creates) a file in `dir`, appends to it,
/// supports rename, a best-effort durability barrier, and a free-space
/// query for the flusher's disk-space governance.
pub struct FileSink {
    dir: Utf8PathBuf,
    filename: String,
    file: File,
}

impl FileSink {
    /// Opens `dir/filename` for create-new, append-mode writing. On most
    /// Unix targets create-new and append compose directly; Windows does
    /// not allow combining `CREATE_NEW` with append mode, so on Windows
    /// this opens create-new only and relies on single-writer
    /// append-at-EOF semantics since only the flusher thread ever writes
    /// to the handle.
    pub fn create_new(dir: &Utf8Path, filename: &str) -> io::Result<Self> {
        let path = dir.join(filename);
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(not(windows))]
        opts.append(true);
        let file = opts.open(&path)?;
        Ok(Self {
            dir: dir.to_owned(),
            filename: filename.to_string(),
            file,
        })
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Renames the underlying file to `new_filename` within the same
    /// directory and updates the tracked filename on success.
    pub fn rename(&mut self, new_filename: &str) -> io::Result<()> {
        if self.filename == new_filename {
            return Ok(());
        }
        let from = self.dir.join(&self.filename);
        let to = self.dir.join(new_filename);
        std::fs::rename(from, to)?;
        self.filename = new_filename.to_string();
        Ok(())
    }

    /// A best-effort durability barrier after a batch of writes: calls
    /// `fdatasync` on Linux, `File::sync_data` (macOS's `fsync`
    /// equivalent) elsewhere on Unix, and `File::sync_all` on Windows
    /// (which invokes `FlushFileBuffers`).
    pub fn sync(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::fdatasync(self.file.as_raw_fd()) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.file.sync_data().or_else(|_| self.file.sync_all())
        }
    }

    /// Available free space on the filesystem backing `dir`, in bytes.
    pub fn free_space(dir: &Utf8Path) -> io::Result<u64> {
        fs2::available_space(dir.as_std_path())
    }
}

impl Sink for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        write_retrying(&mut self.file, data)
    }
}

/// A sink backed by a user-supplied byte consumer, invoked only on the
/// flusher thread.
pub struct CallbackSink {
    write_fn: Box<dyn FnMut(&[u8]) + Send>,
}

impl CallbackSink {
    pub fn new(write_fn: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self {
            write_fn: Box::new(write_fn),
        }
    }
}

impl Sink for CallbackSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (self.write_fn)(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_filename_has_expected_shape() {
        let name = make_random_filename();
        assert!(name.starts_with("wpilog_"));
        assert!(name.ends_with(".wpilog"));
        assert_eq!(name.len(), "wpilog_".len() + 16 + ".wpilog".len());
    }

    #[test]
    fn callback_sink_invokes_closure() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut sink = CallbackSink::new(move |data: &[u8]| {
            seen2.lock().unwrap().push(data.to_vec());
        });
        sink.write(b"hello").unwrap();
        sink.write(b"").unwrap();
        let got = seen.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], b"hello");
        assert_eq!(got[1], Vec::<u8>::new());
    }

    #[test]
    fn file_sink_create_write_rename_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut sink = FileSink::create_new(&dir, "a.wpilog").unwrap();
        sink.write(b"hello").unwrap();
        sink.sync().unwrap();
        sink.rename("b.wpilog").unwrap();
        assert_eq!(sink.filename(), "b.wpilog");
        let contents = std::fs::read(dir.join("b.wpilog")).unwrap();
        assert_eq!(contents, b"hello");
    }
}
