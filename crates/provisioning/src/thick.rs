// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0
//
//! Thick provisioning of freshly created images
//!
//! A thin image only allocates backing storage on first write. Thick provisioning
//! forces the allocation up front by sweeping the whole image with same-pattern
//! writes:
//!
//! - The image is split into fixed-size chunks, each covered by one write
//! - At most `concurrency` writes are in flight at any time, tracked in a slot table
//! - Completions are polled without blocking, and freed slots are refilled in
//!   increasing offset order
//! - The first failure stops all further submissions
//!
//! Only whole chunks are written: a trailing remainder smaller than the chunk size is
//! left untouched.

use std::{
    cmp, thread,
    time::{Duration, Instant},
};

use images::{AccessHint, Completion, Image};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use thiserror::Error;

use crate::progress::{LogProgress, NoProgress, ProgressSink};

/// Default number of writes in flight
pub const DEFAULT_CONCURRENCY: i64 = 10;

/// Default chunk covered by a single write (1MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default length of the repeated pattern (512 bytes)
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Default pause between polls that reaped nothing
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(10);

/// Default time spent collecting in-flight writes after a failure
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Fill byte of the pattern. Zero-filled writes may be skipped by the storage layer.
const PATTERN_BYTE: u8 = 1;

/// Progress message shown while writing
pub(crate) const PROGRESS_MESSAGE: &str = "Writing data for thick provisioning";

/// Errors that can occur while thick provisioning an image
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("cannot determine image size")]
    SizeQuery(#[source] images::Error),

    #[error("invalid concurrency {0}, at least one write must be allowed in flight")]
    InvalidConcurrency(i64),

    #[error("invalid chunk size {chunk_size}, must be a non-zero multiple of the {block_size} byte block")]
    InvalidChunkSize { chunk_size: u64, block_size: u64 },

    #[error("failed to submit write at offset {offset}")]
    Submit {
        offset: u64,
        #[source]
        source: images::Error,
    },

    #[error("write at offset {offset} failed: {errno}")]
    Completion { offset: u64, errno: Errno },
}

impl WriteError {
    /// The error code equivalent of this error
    pub fn errno(&self) -> Errno {
        match self {
            WriteError::SizeQuery(_) | WriteError::InvalidConcurrency(_) | WriteError::InvalidChunkSize { .. } => {
                Errno::EINVAL
            }
            WriteError::Submit { source, .. } => source.errno(),
            WriteError::Completion { errno, .. } => *errno,
        }
    }
}

/// Tunables for a thick provisioning sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThickSettings {
    /// Maximum number of writes in flight
    pub concurrency: i64,
    /// Bytes covered by one write
    pub chunk_size: u64,
    /// Length of the repeated pattern
    pub block_size: u64,
    /// Pause after a poll pass that reaped nothing
    pub poll_interval: Duration,
    /// Time allowed for in-flight writes to finish after a failure
    pub drain_timeout: Duration,
}

impl Default for ThickSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Writes a pattern over every whole chunk of an image
#[derive(Debug, Clone)]
pub struct ThickWriter {
    concurrency: usize,
    chunk_size: u64,
    block_size: usize,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl ThickWriter {
    /// Create a new writer, validating the settings before any I/O takes place
    pub fn new(settings: &ThickSettings) -> Result<Self, WriteError> {
        let concurrency = match usize::try_from(settings.concurrency) {
            Ok(n) if n > 0 => n,
            _ => return Err(WriteError::InvalidConcurrency(settings.concurrency)),
        };

        let invalid_chunk = WriteError::InvalidChunkSize {
            chunk_size: settings.chunk_size,
            block_size: settings.block_size,
        };
        if settings.block_size == 0 || settings.chunk_size == 0 || settings.chunk_size % settings.block_size != 0 {
            return Err(invalid_chunk);
        }
        let block_size = usize::try_from(settings.block_size).map_err(|_| invalid_chunk)?;

        Ok(Self {
            concurrency,
            chunk_size: settings.chunk_size,
            block_size,
            poll_interval: settings.poll_interval,
            drain_timeout: settings.drain_timeout,
        })
    }

    /// Maximum number of writes in flight
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Bytes covered by one write
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Sweep the image, reporting progress to `progress`.
    ///
    /// The image remains owned by the caller and is never closed here. On failure
    /// the originating error is returned and `progress` is told the sweep failed;
    /// chunks written before the failure stay written.
    pub fn write<I>(&self, image: &I, progress: &mut dyn ProgressSink) -> Result<(), WriteError>
    where
        I: Image,
    {
        let image_size = image.size().map_err(WriteError::SizeQuery)?;
        let chunk_count = image_size / self.chunk_size;
        let remainder = image_size % self.chunk_size;

        info!(
            "Thick provisioning {image_size} bytes as {chunk_count} chunks of {} bytes ({} in flight)",
            self.chunk_size, self.concurrency
        );
        if remainder != 0 {
            warn!("Trailing {remainder} bytes are smaller than a chunk and will not be written");
        }

        // More slots than chunks would never be filled
        let slot_count = cmp::min(self.concurrency, usize::try_from(chunk_count).unwrap_or(usize::MAX));
        let mut sweep = Sweep {
            writer: self,
            image,
            pattern: vec![PATTERN_BYTE; self.block_size],
            slots: (0..slot_count).map(|_| None).collect(),
            image_size,
            chunk_count,
            next_chunk: 0,
            completed: 0,
        };

        match sweep.run(progress) {
            Ok(()) => {
                progress.finish();
                info!("Thick provisioning complete, {chunk_count} chunks written");
                Ok(())
            }
            Err(e) => {
                sweep.drain();
                progress.fail();
                error!(
                    "Thick provisioning stopped after {} of {chunk_count} chunks: {e}",
                    sweep.completed
                );
                Err(e)
            }
        }
    }
}

/// Thick provision `image` using `settings`, logging progress unless suppressed
pub fn thick_write<I>(image: &I, settings: &ThickSettings, show_progress: bool) -> Result<(), WriteError>
where
    I: Image,
{
    let writer = ThickWriter::new(settings)?;
    if show_progress {
        writer.write(image, &mut LogProgress::new(PROGRESS_MESSAGE))
    } else {
        writer.write(image, &mut NoProgress)
    }
}

/// A write occupying a slot
struct InFlight<C> {
    chunk: u64,
    completion: C,
}

/// State of a single sweep
struct Sweep<'a, I: Image> {
    writer: &'a ThickWriter,
    image: &'a I,
    pattern: Vec<u8>,
    slots: Vec<Option<InFlight<I::Completion>>>,
    image_size: u64,
    chunk_count: u64,
    /// Next chunk to submit
    next_chunk: u64,
    /// Chunks confirmed written
    completed: u64,
}

impl<I: Image> Sweep<'_, I> {
    fn run(&mut self, progress: &mut dyn ProgressSink) -> Result<(), WriteError> {
        debug!("Starting sweep with {} slots", self.slots.len());
        while self.completed < self.chunk_count {
            self.fill()?;
            if self.poll(progress)? == 0 {
                thread::sleep(self.writer.poll_interval);
            }
        }
        Ok(())
    }

    // Submit writes into every empty slot while chunks remain
    fn fill(&mut self) -> Result<(), WriteError> {
        let chunk_size = self.writer.chunk_size;
        for slot in self.slots.iter_mut().filter(|slot| slot.is_none()) {
            if self.next_chunk >= self.chunk_count {
                break;
            }

            let offset = self.next_chunk * chunk_size;
            let completion = self
                .image
                .write_same(offset, chunk_size, &self.pattern, AccessHint::Sequential)
                .map_err(|source| {
                    error!("Cannot submit write at offset {offset}: {source}");
                    WriteError::Submit { offset, source }
                })?;
            trace!("Submitted chunk {} at offset {offset}", self.next_chunk);

            *slot = Some(InFlight {
                chunk: self.next_chunk,
                completion,
            });
            self.next_chunk += 1;
        }
        Ok(())
    }

    // Reap finished writes, returning how many succeeded
    fn poll(&mut self, progress: &mut dyn ProgressSink) -> Result<usize, WriteError> {
        let chunk_size = self.writer.chunk_size;
        let mut reaped = 0;

        for slot in self.slots.iter_mut() {
            if !slot.as_ref().is_some_and(|op| op.completion.is_complete()) {
                continue;
            }
            let Some(op) = slot.take() else {
                continue;
            };

            let offset = op.chunk * chunk_size;
            let result = op.completion.result();
            op.completion.release();
            if let Err(errno) = result {
                error!("Write at offset {offset} completed with {errno}");
                return Err(WriteError::Completion { offset, errno });
            }

            self.completed += 1;
            reaped += 1;
            trace!("Chunk {} complete ({}/{})", op.chunk, self.completed, self.chunk_count);
            progress.update(cmp::min(self.completed * chunk_size, self.image_size), self.image_size);
        }

        Ok(reaped)
    }

    fn outstanding(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // Release writes as they finish, up to the drain timeout. Anything still in flight
    // after that is abandoned to the image.
    fn drain(&mut self) {
        let deadline = Instant::now() + self.writer.drain_timeout;
        loop {
            for slot in self.slots.iter_mut() {
                if !slot.as_ref().is_some_and(|op| op.completion.is_complete()) {
                    continue;
                }
                if let Some(op) = slot.take() {
                    trace!("Discarding chunk {}: {:?}", op.chunk, op.completion.result());
                    op.completion.release();
                }
            }

            let outstanding = self.outstanding();
            if outstanding == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!("Abandoning {outstanding} writes still in flight");
                self.slots.clear();
                return;
            }
            thread::sleep(self.writer.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use images::{
        mock::{Latency, MockImage},
        AccessHint,
    };
    use test_log::test;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Update(u64, u64),
        Finish,
        Fail,
    }

    #[derive(Debug, Default)]
    struct Recorder(Vec<Event>);

    impl ProgressSink for Recorder {
        fn update(&mut self, done: u64, total: u64) {
            self.0.push(Event::Update(done, total));
        }

        fn finish(&mut self) {
            self.0.push(Event::Finish);
        }

        fn fail(&mut self) {
            self.0.push(Event::Fail);
        }
    }

    impl Recorder {
        fn updates(&self) -> Vec<u64> {
            self.0
                .iter()
                .filter_map(|e| match e {
                    Event::Update(done, _) => Some(*done),
                    _ => None,
                })
                .collect()
        }
    }

    fn writer(concurrency: i64) -> ThickWriter {
        ThickWriter::new(&ThickSettings {
            concurrency,
            poll_interval: Duration::ZERO,
            drain_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_full_sweep() {
        let image = MockImage::new(10 * MIB);
        let mut progress = Recorder::default();
        writer(4).write(&image, &mut progress).unwrap();

        let stats = image.stats();
        assert_eq!(stats.issued, (0..10).map(|i| i * MIB).collect::<Vec<_>>());
        assert!(stats.lengths.iter().all(|l| *l == MIB));
        assert!(stats.hints.iter().all(|h| *h == AccessHint::Sequential));
        assert_eq!(stats.pattern, vec![PATTERN_BYTE; 512]);
        assert!(stats.peak_outstanding <= 4);
        assert_eq!(stats.released, 10);
        assert_eq!(stats.released_early, 0);
        assert_eq!(stats.abandoned, 0);
        assert_eq!(stats.outstanding, 0);

        assert_eq!(progress.updates(), (1..=10).map(|i| i * MIB).collect::<Vec<_>>());
        assert_eq!(progress.0.iter().rev().nth(1), Some(&Event::Update(10 * MIB, 10 * MIB)));
        assert_eq!(progress.0.last(), Some(&Event::Finish));
    }

    #[test]
    fn test_empty_image() {
        let image = MockImage::new(0);
        let mut progress = Recorder::default();
        writer(4).write(&image, &mut progress).unwrap();

        assert_eq!(image.stats().submitted, 0);
        assert_eq!(progress.0, vec![Event::Finish]);
    }

    #[test]
    fn test_image_smaller_than_chunk() {
        let image = MockImage::new(MIB - 512);
        let mut progress = Recorder::default();
        writer(4).write(&image, &mut progress).unwrap();

        assert_eq!(image.stats().submitted, 0);
        assert_eq!(progress.0, vec![Event::Finish]);
    }

    // Known boundary: the trailing partial chunk is never written
    #[test]
    fn test_trailing_partial_chunk_is_not_written() {
        let size = 5 * MIB + 4096;
        let image = MockImage::new(size);
        let mut progress = Recorder::default();
        writer(3).write(&image, &mut progress).unwrap();

        let stats = image.stats();
        assert_eq!(stats.issued.len(), 5);
        assert!(stats.issued.iter().all(|offset| *offset < 5 * MIB));
        assert_eq!(progress.updates().last(), Some(&(5 * MIB)));
        assert!(progress.0.contains(&Event::Update(5 * MIB, size)));
        assert_eq!(progress.0.last(), Some(&Event::Finish));
    }

    #[test]
    fn test_window_is_bounded() {
        for concurrency in [1, 2, 3, 7, 16] {
            let image = MockImage::new(12 * MIB).with_latency(3);
            let mut progress = Recorder::default();
            writer(concurrency).write(&image, &mut progress).unwrap();

            let stats = image.stats();
            assert_eq!(stats.issued.len(), 12);
            assert_eq!(stats.peak_outstanding, cmp::min(concurrency as usize, 12));
            assert_eq!(stats.released, 12);

            // Progress never goes backwards and never exceeds the image
            let updates = progress.updates();
            assert!(updates.windows(2).all(|w| w[0] <= w[1]));
            assert!(updates.iter().all(|done| *done <= 12 * MIB));
        }
    }

    #[test]
    fn test_out_of_order_completion() {
        let image = MockImage::new(8 * MIB)
            .delay(0, Latency::Polls(20))
            .delay(1, Latency::Polls(10));
        let mut progress = Recorder::default();
        writer(4).write(&image, &mut progress).unwrap();

        let stats = image.stats();
        // Submissions stay in offset order regardless of completion order
        assert_eq!(stats.issued, (0..8).map(|i| i * MIB).collect::<Vec<_>>());
        assert_eq!(stats.released, 8);
        assert_eq!(progress.updates().len(), 8);
        assert_eq!(progress.0.last(), Some(&Event::Finish));
    }

    #[test]
    fn test_completion_failure() {
        // Fill phase granularity: every free slot is refilled before polling, so the
        // 4th write is already in flight when the 3rd one is seen to fail.
        let image = MockImage::new(5 * MIB).fail_completion(2, Errno::EIO);
        let mut progress = Recorder::default();
        let err = writer(2).write(&image, &mut progress).unwrap_err();

        assert!(matches!(err, WriteError::Completion { offset, errno: Errno::EIO } if offset == 2 * MIB));
        assert_eq!(err.errno(), Errno::EIO);

        let stats = image.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.issued, vec![0, MIB, 2 * MIB, 3 * MIB]);
        assert_eq!(stats.released, 4);
        assert_eq!(stats.released_early, 0);
        assert_eq!(stats.abandoned, 0);

        assert_eq!(progress.updates(), vec![MIB, 2 * MIB]);
        assert_eq!(progress.0.last(), Some(&Event::Fail));
        assert!(!progress.0.contains(&Event::Finish));
    }

    #[test]
    fn test_submit_failure() {
        let image = MockImage::new(5 * MIB).fail_submit(2, Errno::EAGAIN);
        let mut progress = Recorder::default();
        let err = writer(2).write(&image, &mut progress).unwrap_err();

        assert!(matches!(err, WriteError::Submit { offset, .. } if offset == 2 * MIB));
        assert_eq!(err.errno(), Errno::EAGAIN);

        let stats = image.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.issued.len(), 2);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(progress.0.last(), Some(&Event::Fail));
    }

    #[test]
    fn test_submit_failure_drains_in_flight() {
        let image = MockImage::new(8 * MIB)
            .delay(0, Latency::Polls(5))
            .fail_submit(4, Errno::ENOMEM);
        let mut progress = Recorder::default();
        writer(4).write(&image, &mut progress).unwrap_err();

        // Chunk 0 was still in flight when the submission failed
        let stats = image.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.released, 4);
        assert_eq!(stats.released_early, 0);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.abandoned, 0);
    }

    #[test]
    fn test_failure_releases_completed_slots() {
        // Chunk 1 completes in the same poll pass that observes chunk 0 failing
        let image = MockImage::new(4 * MIB).fail_completion(0, Errno::EIO);
        let mut progress = Recorder::default();
        writer(2).write(&image, &mut progress).unwrap_err();

        let stats = image.stats();
        assert_eq!(stats.issued, vec![0, MIB]);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.outstanding, 0);
        assert!(progress.updates().is_empty());
    }

    #[test]
    fn test_failure_abandons_hung_writes() {
        let image = MockImage::new(4 * MIB)
            .fail_completion(0, Errno::EIO)
            .delay(1, Latency::Never);
        let mut progress = Recorder::default();
        let writer = ThickWriter::new(&ThickSettings {
            concurrency: 2,
            poll_interval: Duration::ZERO,
            drain_timeout: Duration::from_millis(5),
            ..Default::default()
        })
        .unwrap();
        writer.write(&image, &mut progress).unwrap_err();

        let stats = image.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.released_early, 0);
        assert_eq!(progress.0.last(), Some(&Event::Fail));
    }

    #[test]
    fn test_zero_drain_timeout_is_single_pass() {
        let image = MockImage::new(4 * MIB)
            .fail_completion(0, Errno::EIO)
            .delay(1, Latency::Polls(2));
        let writer = ThickWriter::new(&ThickSettings {
            concurrency: 2,
            poll_interval: Duration::ZERO,
            drain_timeout: Duration::ZERO,
            ..Default::default()
        })
        .unwrap();
        writer.write(&image, &mut NoProgress).unwrap_err();

        let stats = image.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.abandoned, 1);
    }

    #[test]
    fn test_size_query_failure() {
        let image = MockImage::new(4 * MIB).fail_size_query();
        let mut progress = Recorder::default();
        let err = writer(2).write(&image, &mut progress).unwrap_err();

        assert!(matches!(err, WriteError::SizeQuery(_)));
        assert_eq!(err.errno(), Errno::EINVAL);
        assert_eq!(image.stats().submitted, 0);
        assert!(progress.0.is_empty());
    }

    #[test]
    fn test_invalid_settings() {
        for concurrency in [0, -1, i64::MIN] {
            let err = ThickWriter::new(&ThickSettings {
                concurrency,
                ..Default::default()
            })
            .unwrap_err();
            assert!(matches!(err, WriteError::InvalidConcurrency(n) if n == concurrency));
            assert_eq!(err.errno(), Errno::EINVAL);
        }

        for (chunk_size, block_size) in [(0, 512), (MIB, 0), (MIB, 1000)] {
            let err = ThickWriter::new(&ThickSettings {
                chunk_size,
                block_size,
                ..Default::default()
            })
            .unwrap_err();
            assert!(matches!(err, WriteError::InvalidChunkSize { .. }));
        }
    }

    #[test]
    fn test_huge_concurrency() {
        let image = MockImage::new(4 * MIB);
        let mut progress = Recorder::default();
        writer(i64::MAX).write(&image, &mut progress).unwrap();

        let stats = image.stats();
        assert_eq!(stats.issued.len(), 4);
        assert_eq!(stats.peak_outstanding, 4);
        assert_eq!(stats.released, 4);
        assert_eq!(progress.0.last(), Some(&Event::Finish));
    }

    #[test]
    fn test_thick_write_defaults() {
        let image = MockImage::new(3 * MIB);
        thick_write(&image, &ThickSettings::default(), false).unwrap();
        assert_eq!(image.stats().issued.len(), 3);

        let image = MockImage::new(2 * MIB);
        thick_write(&image, &ThickSettings::default(), true).unwrap();
        assert_eq!(image.stats().released, 2);

        let image = MockImage::new(2 * MIB);
        let settings = ThickSettings {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            thick_write(&image, &settings, false),
            Err(WriteError::InvalidConcurrency(0))
        ));
        assert_eq!(image.stats().submitted, 0);
    }
}
