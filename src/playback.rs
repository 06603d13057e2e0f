//! Gap-free scheduling of inbound audio against an output clock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use crate::codec::PlaybackBuffer;
use crate::error::Result;

/// Opaque id of one scheduled buffer. Never reused within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An audio output with its own monotonic clock.
///
/// Buffers started on the context play at an absolute clock time. A buffer
/// that finishes on its own is reported through the completion channel the
/// context was created with; a stopped buffer is never reported.
pub trait OutputContext {
    /// Seconds elapsed on the output clock.
    fn current_time(&self) -> f64;

    fn start(&mut self, id: HandleId, buffer: PlaybackBuffer, at: f64) -> Result<()>;

    /// Stop a buffer. Unknown or already finished ids are ignored.
    fn stop(&mut self, id: HandleId);

    /// Release the device.
    fn close(self) -> impl Future<Output = Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledHandle {
    pub id: HandleId,
    /// Generation of the session the audio belongs to.
    pub generation: u64,
    pub start: f64,
    pub duration: f64,
}

/// Keeps a cursor on the output clock and the set of buffers not yet played.
pub struct PlaybackScheduler<O: OutputContext> {
    output: Option<O>,
    cursor: f64,
    scheduled: HashMap<HandleId, ScheduledHandle>,
    next_id: u64,
}

impl<O: OutputContext> Default for PlaybackScheduler<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: OutputContext> PlaybackScheduler<O> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            output: None,
            cursor: 0.0,
            scheduled: HashMap::new(),
            next_id: 0,
        }
    }

    /// Bind the output context of a new session.
    pub fn attach(&mut self, output: O) {
        self.flush();
        self.output = Some(output);
    }

    /// Flush and hand back the current output context for closing.
    pub fn detach(&mut self) -> Option<O> {
        self.flush();
        self.output.take()
    }

    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.output.is_some()
    }

    /// Schedule a buffer directly after everything already scheduled.
    ///
    /// Returns `None` when no output is attached or the buffer is empty.
    pub fn enqueue(&mut self, generation: u64, buffer: PlaybackBuffer) -> Result<Option<HandleId>> {
        let Some(output) = self.output.as_mut() else {
            tracing::debug!("no output attached, dropping {} samples", buffer.samples.len());
            return Ok(None);
        };
        if buffer.is_empty() {
            return Ok(None);
        }

        let duration = buffer.duration();
        // A cursor behind the clock means playback ran dry; restart at "now".
        let start = self.cursor.max(output.current_time());

        let id = HandleId::new(self.next_id);
        self.next_id += 1;

        output.start(id, buffer, start)?;
        self.cursor = start + duration;
        self.scheduled.insert(
            id,
            ScheduledHandle {
                id,
                generation,
                start,
                duration,
            },
        );

        tracing::trace!("scheduled {id} at {start:.3}s for {duration:.3}s");
        Ok(Some(id))
    }

    /// A buffer finished playing on its own.
    pub fn complete(&mut self, id: HandleId) {
        if self.scheduled.remove(&id).is_none() {
            tracing::trace!("completion for unknown handle {id} ignored");
        }
    }

    /// Stop everything scheduled and rewind the cursor.
    pub fn flush(&mut self) {
        if let Some(output) = self.output.as_mut() {
            for id in self.scheduled.keys() {
                output.stop(*id);
            }
        }
        if !self.scheduled.is_empty() {
            tracing::debug!("flushed {} scheduled buffers", self.scheduled.len());
        }
        self.scheduled.clear();
        self.cursor = 0.0;
    }

    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    #[must_use]
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<&ScheduledHandle> {
        self.scheduled.get(&id)
    }
}
