use std::{fmt, sync::Arc};

use crossbeam_channel::Sender;

use crate::{Clip, Result};

/// Natural end-of-stream notification for one prepared handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub clip_index: usize,
    /// Sequencer session the handle belongs to. Completions from a torn-down
    /// session carry an outdated generation and are ignored.
    pub generation: u64,
}

/// One-shot notifier handed to the engine when a clip is prepared. The engine
/// fires it when the handle reaches its natural end, never on explicit stop.
#[derive(Clone)]
pub struct CompletionSignal {
    tx: Sender<Completion>,
    completion: Completion,
}

impl CompletionSignal {
    pub fn new(tx: Sender<Completion>, clip_index: usize, generation: u64) -> Self {
        Self {
            tx,
            completion: Completion {
                clip_index,
                generation,
            },
        }
    }

    pub fn clip_index(&self) -> usize {
        self.completion.clip_index
    }

    pub fn notify(&self) {
        if self.tx.send(self.completion).is_err() {
            tracing::debug!(
                clip_index = self.completion.clip_index,
                "completion dropped, sequencer is gone"
            );
        }
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("completion", &self.completion)
            .finish()
    }
}

/// Audio playback backend. Decoding and output are entirely up to the
/// implementation; the sequencer only drives handles through this contract.
pub trait PlaybackEngine: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Opens the clip's byte source and prepares it for playback without
    /// starting it.
    fn prepare(&self, clip: &Clip, completion: CompletionSignal) -> Result<Self::Handle>;

    fn start(&self, handle: &mut Self::Handle) -> Result<()>;

    /// Position reported by the engine. May lag behind the audible position.
    fn current_position_millis(&self, handle: &Self::Handle) -> u64;

    fn is_playing(&self, handle: &Self::Handle) -> bool;

    fn stop(&self, handle: &mut Self::Handle);

    fn reset(&self, handle: &mut Self::Handle);

    /// Frees the handle and closes its byte source.
    fn release(&self, handle: Self::Handle);
}

/// Owning wrapper around a prepared engine handle. The handle is stopped,
/// reset and released exactly once, either through [`ClipPlayer::release`] or
/// on drop.
pub struct ClipPlayer<E: PlaybackEngine> {
    engine: Arc<E>,
    clip_index: usize,
    handle: Option<E::Handle>,
    started: bool,
}

impl<E: PlaybackEngine> ClipPlayer<E> {
    /// Prepares `clip` on `engine`.
    pub fn prepare(
        engine: Arc<E>,
        clip: &Clip,
        clip_index: usize,
        completion: CompletionSignal,
    ) -> Result<Self> {
        let handle = engine.prepare(clip, completion)?;
        Ok(Self {
            engine,
            clip_index,
            handle: Some(handle),
            started: false,
        })
    }

    pub fn clip_index(&self) -> usize {
        self.clip_index
    }

    pub fn is_started(&self) -> bool {
        self.started && self.handle.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    pub fn start(&mut self) -> Result<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| crate::LoggerError::msg("cannot start a released clip"))?;
        self.engine.start(handle)?;
        self.started = true;
        Ok(())
    }

    pub fn position_millis(&self) -> Option<u64> {
        self.handle
            .as_ref()
            .map(|handle| self.engine.current_position_millis(handle))
    }

    pub fn is_playing(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| self.engine.is_playing(handle))
            .unwrap_or(false)
    }

    /// Stops, resets and releases the underlying handle. Calling it again is a
    /// no-op.
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.engine.stop(&mut handle);
            self.engine.reset(&mut handle);
            self.engine.release(handle);
            self.started = false;
        }
    }
}

impl<E: PlaybackEngine> Drop for ClipPlayer<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: PlaybackEngine> fmt::Debug for ClipPlayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipPlayer")
            .field("clip_index", &self.clip_index)
            .field("started", &self.started)
            .field("released", &self.is_released())
            .finish()
    }
}
