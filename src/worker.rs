// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of hardware job completions to a session.
//!
//! The transport reports the end of a job from its interrupt context through a
//! [`CompletionNotifier`], which only queues the event and signals an eventfd. The events are
//! then handled either synchronously by the session owner, or by a [`CompletionWorker`]
//! thread sleeping on the eventfd.
//!
//! Every event is stamped with the generation of the notifier at the time it was raised. The
//! session starts a new generation whenever it abandons its jobs, so that an event taken from
//! the queue before that point cannot complete a job submitted after it.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to create EventFd for job completions: {0}")]
    EventFd(Errno),
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
}

/// Event raised by the hardware for the job in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// The job finished, its result can be read with `output_info`.
    Completed,
    /// The hardware hit an unrecoverable error.
    Fatal,
}

/// A [`JobEvent`] along with the notifier generation it was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobNotice {
    pub event: JobEvent,
    pub generation: u64,
}

/// Sending side of the completion channel of one session. Cheap to clone.
#[derive(Clone)]
pub struct CompletionNotifier {
    events: Arc<Mutex<VecDeque<JobNotice>>>,
    generation: Arc<AtomicU64>,
    job_event: Arc<EventFd>,
}

impl CompletionNotifier {
    pub fn new() -> Result<Self, WorkerError> {
        Ok(Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            generation: Arc::new(AtomicU64::new(0)),
            job_event: Arc::new(
                EventFd::from_flags(EfdFlags::EFD_NONBLOCK).map_err(WorkerError::EventFd)?,
            ),
        })
    }

    /// Queues `event` and wakes up whoever waits for completions.
    pub fn notify(&self, event: JobEvent) {
        match self.events.lock() {
            Ok(mut events) => {
                let generation = self.generation.load(Ordering::Acquire);
                events.push_back(JobNotice { event, generation });
            }
            Err(_) => {
                log::error!("completion queue poisoned, dropping event={:?}", event);
                return;
            }
        }

        if let Err(e) = self.job_event.write(1) {
            log::error!("failed to signal job event: {}", e);
        }
    }

    /// Takes every pending event, oldest first.
    pub fn drain(&self) -> Vec<JobNotice> {
        // Clear the wakeups before taking the events, so that none is lost.
        match self.job_event.read() {
            Ok(_) | Err(Errno::EAGAIN) => (),
            Err(e) => log::warn!("failed to read job event: {}", e),
        }

        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => {
                log::error!("completion queue poisoned");
                Vec::new()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().map(|events| events.is_empty()).unwrap_or(true)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new generation, making every event raised so far stale. Events still queued
    /// are dropped. Returns the new generation.
    pub fn new_generation(&self) -> u64 {
        // Bump under the queue lock so that no event gets queued with the old generation.
        let (generation, dropped) = match self.events.lock() {
            Ok(mut events) => {
                let dropped = events.drain(..).count();
                (self.generation.fetch_add(1, Ordering::AcqRel) + 1, dropped)
            }
            Err(_) => (self.generation.fetch_add(1, Ordering::AcqRel) + 1, 0),
        };
        log::debug!("completion generation {} started, dropped {} events", generation, dropped);
        generation
    }

    /// Whether `notice` was raised in the current generation.
    pub fn is_current(&self, notice: &JobNotice) -> bool {
        notice.generation == self.generation()
    }

    fn wake(&self) {
        if let Err(e) = self.job_event.write(1) {
            log::error!("failed to wake completion worker: {}", e);
        }
    }
}

/// Thread running a handler for every completion delivered to a notifier.
pub struct CompletionWorker {
    notifier: CompletionNotifier,
    running: Arc<AtomicBool>,
    worker_thread: Option<JoinHandle<()>>,
}

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

impl CompletionWorker {
    pub fn spawn<F>(notifier: CompletionNotifier, mut handler: F) -> Result<Self, WorkerError>
    where
        F: FnMut(JobNotice) + Send + 'static,
    {
        let epoll_fd = Epoll::new(EpollCreateFlags::empty()).map_err(WorkerError::Epoll)?;
        epoll_fd
            .add(notifier.job_event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .map_err(WorkerError::EpollAdd)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_notifier = notifier.clone();
        let timeout = EpollTimeout::try_from(POLL_TIMEOUT).unwrap_or(EpollTimeout::NONE);

        let worker_thread = thread::spawn(move || {
            while thread_running.load(Ordering::Acquire) {
                let mut events = [EpollEvent::empty()];
                match epoll_fd.wait(&mut events, timeout) {
                    Ok(_) | Err(Errno::EINTR) => (),
                    Err(e) => {
                        log::error!("completion worker failed to wait: {}", e);
                        break;
                    }
                }

                if !thread_running.load(Ordering::Acquire) {
                    break;
                }

                for notice in thread_notifier.drain() {
                    log::trace!("completion worker got notice={:?}", notice);
                    handler(notice);
                }
            }

            log::debug!("completion worker exiting");
        });

        Ok(Self { notifier, running, worker_thread: Some(worker_thread) })
    }

    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    /// Stops the thread. Events still queued are left for the next consumer.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.notifier.wake();

        if let Some(worker_thread) = self.worker_thread.take() {
            let _ = worker_thread.join();
        }
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
