// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Directory-backed image pool.
//!
//! Each image is stored as a sparse data file `<name>.img` next to a JSON metadata
//! file `<name>.json`. Writes against an open image are queued to a small set of
//! worker threads owned by that image and complete in whatever order the workers
//! finish them.

use std::{
    cmp, fs, io,
    os::{fd::AsRawFd, unix::fs::FileExt},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
};

use log::{debug, error, info, trace};
use nix::{
    errno::Errno,
    fcntl::{posix_fadvise, PosixFadviseAdvice},
    libc,
};
use serde::{Deserialize, Serialize};

use crate::{validate_name, validate_write, AccessHint, Completion, Error, Image, ImageOptions, ImageStore};

const DATA_EXTENSION: &str = "img";
const METADATA_EXTENSION: &str = "json";

/// Worker threads started per open image unless configured otherwise
pub const DEFAULT_WORKERS: usize = 4;

/// Upper bound of the buffer a pattern is expanded into before writing
const FILL_BUFFER_SIZE: usize = 64 * 1024;

/// Persistent description of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image size in bytes
    pub size: u64,
    /// Effective options the image was created with
    pub options: ImageOptions,
}

/// A pool of images stored in a directory
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    workers: usize,
}

impl FileStore {
    /// Opens the pool rooted at `root`, which must be an existing directory.
    pub fn open<P>(root: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::InvalidPool(root.to_owned()));
        }
        debug!("Opened image pool at {:?}", root);
        Ok(Self {
            root: root.to_owned(),
            workers: DEFAULT_WORKERS,
        })
    }

    /// Sets the number of worker threads started for each opened image.
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    /// Returns the pool directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the image's data file.
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{DATA_EXTENSION}"))
    }

    /// Returns the path of the image's metadata file.
    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{METADATA_EXTENSION}"))
    }

    /// Reads the stored description of an image.
    pub fn info(&self, name: &str) -> Result<ImageInfo, Error> {
        validate_name(name)?;
        let file = fs::File::open(self.metadata_path(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(name.to_owned()),
            _ => Error::IO(e),
        })?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }
}

/// Creates a sparse file of `size` bytes, failing if it already exists.
fn create_sparse(path: &Path, size: u64) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

impl ImageStore for FileStore {
    type Image = FileImage;

    fn create(&self, name: &str, size: u64, options: &ImageOptions) -> Result<(), Error> {
        validate_name(name)?;
        let options = options.validate()?;
        let info = ImageInfo { size, options };

        // The metadata file doubles as the existence lock for the image name
        let metadata_path = self.metadata_path(name);
        let metadata = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&metadata_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::AlreadyExists(name.to_owned()),
                _ => Error::IO(e),
            })?;

        let written = serde_json::to_writer_pretty(&metadata, &info)
            .map_err(Error::from)
            .and_then(|_| create_sparse(&self.data_path(name), size).map_err(Error::from));
        if let Err(e) = written {
            let _ = fs::remove_file(&metadata_path);
            return Err(e);
        }

        info!("Created image {name} ({size} bytes, features: {})", info.options.features);
        Ok(())
    }

    fn open(&self, name: &str) -> Result<Self::Image, Error> {
        let info = self.info(name)?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.data_path(name))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NotFound(name.to_owned()),
                _ => Error::IO(e),
            })?;
        debug!("Opened image {name} ({} bytes) with {} workers", info.size, self.workers);
        Ok(FileImage::new(name, file, self.workers))
    }

    fn close(&self, mut image: Self::Image) -> Result<(), Error> {
        image.shutdown();
        image.file.sync_data()?;
        debug!("Closed image {}", image.name);
        Ok(())
    }
}

/// Shared outcome of a queued write
type Outcome = Arc<OnceLock<Result<(), Errno>>>;

/// A write waiting for a worker
struct Job {
    offset: u64,
    length: u64,
    pattern: Vec<u8>,
    hint: AccessHint,
    outcome: Outcome,
}

/// An open image backed by a file
pub struct FileImage {
    name: String,
    file: Arc<fs::File>,
    jobs: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl FileImage {
    fn new(name: &str, file: fs::File, workers: usize) -> Self {
        let file = Arc::new(file);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|_| {
                let file = file.clone();
                let receiver = receiver.clone();
                thread::spawn(move || worker(&file, &receiver))
            })
            .collect();

        Self {
            name: name.to_owned(),
            file,
            jobs: Some(sender),
            workers,
        }
    }

    /// Returns the image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // Stop accepting writes and wait for the queue to drain
    fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Write worker for image {} panicked", self.name);
            }
        }
    }
}

impl Drop for FileImage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Image for FileImage {
    type Completion = FileCompletion;

    fn size(&self) -> Result<u64, Error> {
        Ok(self.file.metadata()?.len())
    }

    fn write_same(
        &self,
        offset: u64,
        length: u64,
        pattern: &[u8],
        hint: AccessHint,
    ) -> Result<Self::Completion, Error> {
        validate_write(offset, length, pattern, self.size()?)?;

        let outcome = Outcome::default();
        let job = Job {
            offset,
            length,
            pattern: pattern.to_vec(),
            hint,
            outcome: outcome.clone(),
        };
        let jobs = self.jobs.as_ref().ok_or(Error::Submit(Errno::ESHUTDOWN))?;
        jobs.send(job).map_err(|_| Error::Submit(Errno::ESHUTDOWN))?;
        Ok(FileCompletion(outcome))
    }
}

/// Completion handle for a write queued on a [`FileImage`]
#[derive(Debug)]
pub struct FileCompletion(Outcome);

impl Completion for FileCompletion {
    fn is_complete(&self) -> bool {
        self.0.get().is_some()
    }

    fn result(&self) -> Result<(), Errno> {
        self.0.get().copied().unwrap_or(Err(Errno::EINPROGRESS))
    }
}

fn worker(file: &fs::File, jobs: &Mutex<mpsc::Receiver<Job>>) {
    loop {
        let job = match jobs.lock() {
            Ok(receiver) => match receiver.recv() {
                Ok(job) => job,
                Err(_) => return,
            },
            Err(_) => return,
        };
        let result = execute(file, &job);
        if let Err(errno) = result {
            error!("Write of {} bytes at {} failed: {errno}", job.length, job.offset);
        }
        let _ = job.outcome.set(result);
    }
}

fn execute(file: &fs::File, job: &Job) -> Result<(), Errno> {
    // An all-zero pattern leaves the range unallocated
    if job.pattern.iter().all(|b| *b == 0) {
        trace!("Skipping zero write of {} bytes at {}", job.length, job.offset);
        return Ok(());
    }

    if job.hint == AccessHint::Sequential {
        if let Err(e) = posix_fadvise(
            file.as_raw_fd(),
            job.offset as libc::off_t,
            job.length as libc::off_t,
            PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
        ) {
            trace!("Ignoring fadvise failure: {e}");
        }
    }

    let repeats = cmp::max(1, FILL_BUFFER_SIZE / job.pattern.len());
    let buffer = job.pattern.repeat(repeats);

    let end = job.offset + job.length;
    let mut offset = job.offset;
    while offset < end {
        let length = cmp::min(buffer.len() as u64, end - offset) as usize;
        file.write_all_at(&buffer[..length], offset)
            .map_err(|e| e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))?;
        offset += length as u64;
    }
    Ok(())
}
