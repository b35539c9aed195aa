// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Mock image store for testing.
//!
//! This module provides a scripted, single-threaded image implementation that can be
//! used to drive image writers through success, failure and slow-completion paths
//! without touching real storage. Every handle it issues is accounted for, so tests
//! can check for leaked or prematurely released operations.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use nix::errno::Errno;

use crate::{validate_name, validate_write, AccessHint, Completion, Error, Image, ImageOptions, ImageStore};

/// How long a scripted write takes to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// Completes after the given number of unsuccessful polls
    Polls(u32),
    /// Never completes
    Never,
}

/// Scripted outcomes, keyed by the submission sequence number (starting at zero)
#[derive(Debug, Clone, Default)]
struct Script {
    fail_size: bool,
    submit_failures: HashMap<usize, Errno>,
    completion_failures: HashMap<usize, Errno>,
    latencies: HashMap<usize, Latency>,
    default_polls: u32,
}

/// Observations recorded by a mock image
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    /// Number of submission attempts, including rejected ones
    pub submitted: usize,
    /// Offsets of accepted writes in submission order
    pub issued: Vec<u64>,
    /// Lengths of accepted writes in submission order
    pub lengths: Vec<u64>,
    /// Access hints of accepted writes
    pub hints: Vec<AccessHint>,
    /// Pattern of the most recent write
    pub pattern: Vec<u8>,
    /// Handles issued but neither released nor abandoned
    pub outstanding: usize,
    /// Highest value `outstanding` reached
    pub peak_outstanding: usize,
    /// Handles released by the caller
    pub released: usize,
    /// Handles released before their write completed
    pub released_early: usize,
    /// Handles dropped without a release
    pub abandoned: usize,
    /// Number of completion checks
    pub polls: usize,
}

/// A scripted image
#[derive(Debug, Clone)]
pub struct MockImage {
    size: u64,
    script: Script,
    stats: Rc<RefCell<MockStats>>,
}

impl MockImage {
    /// Creates a new mock image of `size` bytes whose writes all succeed on first poll
    pub fn new(size: u64) -> Self {
        Self {
            size,
            script: Script::default(),
            stats: Rc::default(),
        }
    }

    /// Makes every size query fail
    pub fn fail_size_query(mut self) -> Self {
        self.script.fail_size = true;
        self
    }

    /// Rejects the `nth` submission with `errno`
    pub fn fail_submit(mut self, nth: usize, errno: Errno) -> Self {
        self.script.submit_failures.insert(nth, errno);
        self
    }

    /// Completes the `nth` submission with `errno`
    pub fn fail_completion(mut self, nth: usize, errno: Errno) -> Self {
        self.script.completion_failures.insert(nth, errno);
        self
    }

    /// Sets how many polls every write needs before completing
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.script.default_polls = polls;
        self
    }

    /// Overrides the latency of the `nth` submission
    pub fn delay(mut self, nth: usize, latency: Latency) -> Self {
        self.script.latencies.insert(nth, latency);
        self
    }

    /// Returns a snapshot of the recorded observations
    pub fn stats(&self) -> MockStats {
        self.stats.borrow().clone()
    }
}

impl Image for MockImage {
    type Completion = MockCompletion;

    fn size(&self) -> Result<u64, Error> {
        if self.script.fail_size {
            Err(Error::SizeQuery)
        } else {
            Ok(self.size)
        }
    }

    fn write_same(
        &self,
        offset: u64,
        length: u64,
        pattern: &[u8],
        hint: AccessHint,
    ) -> Result<Self::Completion, Error> {
        validate_write(offset, length, pattern, self.size)?;

        let mut stats = self.stats.borrow_mut();
        let nth = stats.submitted;
        stats.submitted += 1;
        if let Some(errno) = self.script.submit_failures.get(&nth) {
            return Err(Error::Submit(*errno));
        }

        stats.issued.push(offset);
        stats.lengths.push(length);
        stats.hints.push(hint);
        stats.pattern = pattern.to_vec();
        stats.outstanding += 1;
        stats.peak_outstanding = stats.peak_outstanding.max(stats.outstanding);

        let remaining = match self
            .script
            .latencies
            .get(&nth)
            .copied()
            .unwrap_or(Latency::Polls(self.script.default_polls))
        {
            Latency::Polls(polls) => Some(polls),
            Latency::Never => None,
        };

        Ok(MockCompletion {
            stats: self.stats.clone(),
            remaining: Cell::new(remaining),
            observed: Cell::new(false),
            outcome: self.script.completion_failures.get(&nth).map_or(Ok(()), |e| Err(*e)),
            released: false,
        })
    }
}

/// Completion handle issued by a [`MockImage`]
#[derive(Debug)]
pub struct MockCompletion {
    stats: Rc<RefCell<MockStats>>,
    remaining: Cell<Option<u32>>,
    /// Set once `is_complete` has reported completion
    observed: Cell<bool>,
    outcome: Result<(), Errno>,
    released: bool,
}

impl MockCompletion {
    fn done(&self) -> bool {
        self.observed.get()
    }
}

impl Completion for MockCompletion {
    fn is_complete(&self) -> bool {
        self.stats.borrow_mut().polls += 1;
        match self.remaining.get() {
            Some(0) => {
                self.observed.set(true);
                true
            }
            Some(n) => {
                self.remaining.set(Some(n - 1));
                false
            }
            None => false,
        }
    }

    fn result(&self) -> Result<(), Errno> {
        if self.done() {
            self.outcome
        } else {
            Err(Errno::EINPROGRESS)
        }
    }

    fn release(mut self) {
        self.released = true;
        let mut stats = self.stats.borrow_mut();
        stats.released += 1;
        stats.outstanding -= 1;
        if !self.done() {
            stats.released_early += 1;
        }
    }
}

impl Drop for MockCompletion {
    fn drop(&mut self) {
        if !self.released {
            self.stats.borrow_mut().abandoned += 1;
        }
    }
}

/// A scripted in-memory pool
#[derive(Debug, Default)]
pub struct MockStore {
    images: RefCell<HashMap<String, (u64, ImageOptions)>>,
    prepared: RefCell<HashMap<String, MockImage>>,
    opened: Cell<usize>,
    closed: Cell<usize>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out `image` the next time `name` is opened
    pub fn prepare(&self, name: &str, image: MockImage) {
        self.prepared.borrow_mut().insert(name.to_owned(), image);
    }

    /// Returns the size and effective options of a created image
    pub fn image(&self, name: &str) -> Option<(u64, ImageOptions)> {
        self.images.borrow().get(name).cloned()
    }

    /// Number of images opened so far
    pub fn opened(&self) -> usize {
        self.opened.get()
    }

    /// Number of images closed so far
    pub fn closed(&self) -> usize {
        self.closed.get()
    }
}

impl ImageStore for MockStore {
    type Image = MockImage;

    fn create(&self, name: &str, size: u64, options: &ImageOptions) -> Result<(), Error> {
        validate_name(name)?;
        let options = options.validate()?;
        let mut images = self.images.borrow_mut();
        if images.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        images.insert(name.to_owned(), (size, options));
        Ok(())
    }

    fn open(&self, name: &str) -> Result<Self::Image, Error> {
        let (size, _) = self.image(name).ok_or_else(|| Error::NotFound(name.to_owned()))?;
        self.opened.set(self.opened.get() + 1);
        Ok(self
            .prepared
            .borrow_mut()
            .remove(name)
            .unwrap_or_else(|| MockImage::new(size)))
    }

    fn close(&self, _image: Self::Image) -> Result<(), Error> {
        self.closed.set(self.closed.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_latency_and_release() {
        let image = MockImage::new(4096).with_latency(2);
        let completion = image.write_same(0, 1024, &[1; 512], AccessHint::Normal).unwrap();
        assert!(!completion.is_complete());
        assert!(!completion.is_complete());
        assert_eq!(completion.result(), Err(Errno::EINPROGRESS));
        assert!(completion.is_complete());
        assert_eq!(completion.result(), Ok(()));
        completion.release();

        let stats = image.stats();
        assert_eq!(stats.issued, vec![0]);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.released_early, 0);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.polls, 3);
    }

    #[test]
    fn test_result_requires_completion() {
        // A zero latency write still reports nothing until it has been polled
        let image = MockImage::new(4096);
        let completion = image.write_same(0, 512, &[1; 512], AccessHint::Normal).unwrap();
        assert_eq!(completion.result(), Err(Errno::EINPROGRESS));
        assert!(completion.is_complete());
        assert_eq!(completion.result(), Ok(()));

        let early = image.write_same(512, 512, &[1; 512], AccessHint::Normal).unwrap();
        early.release();
        completion.release();

        let stats = image.stats();
        assert_eq!(stats.released, 2);
        assert_eq!(stats.released_early, 1);
    }

    #[test]
    fn test_scripted_failures() {
        let image = MockImage::new(4096)
            .fail_submit(0, Errno::EAGAIN)
            .fail_completion(1, Errno::EIO)
            .delay(2, Latency::Never);

        assert!(matches!(
            image.write_same(0, 512, &[1; 512], AccessHint::Normal),
            Err(Error::Submit(Errno::EAGAIN))
        ));

        let failing = image.write_same(512, 512, &[1; 512], AccessHint::Normal).unwrap();
        assert!(failing.is_complete());
        assert_eq!(failing.result(), Err(Errno::EIO));
        failing.release();

        let hung = image.write_same(1024, 512, &[1; 512], AccessHint::Normal).unwrap();
        for _ in 0..100 {
            assert!(!hung.is_complete());
        }
        drop(hung);

        let stats = image.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.issued, vec![512, 1024]);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.peak_outstanding, 1);
    }

    #[test]
    fn test_store() {
        let store = MockStore::new();
        store.create("disk0", 8192, &ImageOptions::default()).unwrap();
        assert!(matches!(
            store.create("disk0", 8192, &ImageOptions::default()),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(store.open("disk1"), Err(Error::NotFound(_))));

        let prepared = MockImage::new(4096);
        store.prepare("disk0", prepared.clone());
        let image = store.open("disk0").unwrap();
        assert_eq!(image.size().unwrap(), 4096);
        let completion = image.write_same(0, 512, &[1; 512], AccessHint::Normal).unwrap();
        assert!(completion.is_complete());
        completion.release();
        assert_eq!(prepared.stats().released, 1);
        store.close(image).unwrap();

        // Unprepared opens yield a default image of the created size
        let image = store.open("disk0").unwrap();
        assert_eq!(image.size().unwrap(), 8192);
        store.close(image).unwrap();
        assert_eq!(store.opened(), 2);
        assert_eq!(store.closed(), 2);
    }
}
