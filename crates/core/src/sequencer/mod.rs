//! Gapless clip sequencing.
//!
//! As soon as clip `i` starts, clip `i + 1` is prepared on a background
//! thread and parked in a prefetch slot. When clip `i` completes, the parked
//! handle is promoted and started, so the gap between clips is only the cost
//! of `start` rather than a full prepare. The elapsed-time baseline is taken
//! right after the promoted handle starts.
//!
//! A prefetch that is still running when its predecessor completes is waited
//! for outside the state lock. Meanwhile the sequencer is `Advancing`, which
//! readers see as "no clip playing", so sensor callbacks never stall behind a
//! slow prepare.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    playback::{ClipPlayer, Completion, CompletionSignal, PlaybackEngine},
    ClipCatalog, LoggerError, Result, SharedClock,
};

/// Half-open range `start..end` of catalog indices to play in one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackWindow {
    start: usize,
    end: usize,
}

impl PlaybackWindow {
    /// Validates `start..end` against a catalog of `catalog_len` clips.
    pub fn new(start: usize, end: usize, catalog_len: usize) -> Result<Self> {
        if start > end || end > catalog_len {
            return Err(LoggerError::InvalidRange {
                start,
                end,
                len: catalog_len,
            });
        }
        Ok(Self { start, end })
    }

    /// Missing bounds default to the whole catalog.
    pub fn from_bounds(
        start: Option<usize>,
        end: Option<usize>,
        catalog_len: usize,
    ) -> Result<Self> {
        Self::new(start.unwrap_or(0), end.unwrap_or(catalog_len), catalog_len)
    }

    pub fn full(catalog_len: usize) -> Self {
        Self {
            start: 0,
            end: catalog_len,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }
}

/// Snapshot of what is playing, taken under the sequencer lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub clip_index: usize,
    pub clip_name: String,
    /// Position reported by the engine.
    pub media_position_millis: u64,
    /// Locally measured time since the clip started. Used for correlation.
    pub elapsed_since_clip_start_millis: u64,
}

/// Track information shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackDisplay {
    pub name: String,
    /// Clips played so far in the window, counting the current one from zero.
    pub index: usize,
    pub total: usize,
}

/// Outcome of handling a clip completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The next clip in the window is now playing.
    Advanced { clip_index: usize },
    /// The window is exhausted and the sequencer is idle.
    Finished,
    /// Nothing was playing, or the completion belonged to another handle.
    Ignored,
}

enum Prefetch<E: PlaybackEngine> {
    Ready(ClipPlayer<E>),
    Pending {
        clip_index: usize,
        rx: Receiver<Result<ClipPlayer<E>>>,
    },
}

impl<E: PlaybackEngine> Prefetch<E> {
    fn clip_index(&self) -> usize {
        match self {
            Prefetch::Ready(player) => player.clip_index(),
            Prefetch::Pending { clip_index, .. } => *clip_index,
        }
    }

    /// Blocks until the prepared player is available.
    fn wait(self) -> Result<ClipPlayer<E>> {
        match self {
            Prefetch::Ready(player) => Ok(player),
            Prefetch::Pending { clip_index, rx } => rx.recv().map_err(|_| {
                LoggerError::msg(format!("prefetch worker for clip {clip_index} vanished"))
            })?,
        }
    }
}

struct ActivePlayback<E: PlaybackEngine> {
    window: PlaybackWindow,
    generation: u64,
    active: ClipPlayer<E>,
    started_at: Instant,
    next: Option<Prefetch<E>>,
}

enum PlaybackState<E: PlaybackEngine> {
    Idle,
    Playing(ActivePlayback<E>),
    /// Between releasing a finished clip and starting its successor.
    Advancing {
        generation: u64,
        clip_index: usize,
    },
}

/// Plays a window of the clip catalog back to back.
///
/// All state lives behind one mutex. A clip index and its start instant are
/// always installed together, so readers never see a new clip paired with the
/// previous clip's start instant.
pub struct PlaybackSequencer<E: PlaybackEngine> {
    catalog: Arc<ClipCatalog>,
    engine: Arc<E>,
    clock: SharedClock,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    generation: AtomicU64,
    state: Mutex<PlaybackState<E>>,
}

impl<E: PlaybackEngine> PlaybackSequencer<E> {
    pub fn new(catalog: Arc<ClipCatalog>, engine: Arc<E>, clock: SharedClock) -> Self {
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        Self {
            catalog,
            engine,
            clock,
            completions_tx,
            completions_rx,
            generation: AtomicU64::new(0),
            state: Mutex::new(PlaybackState::Idle),
        }
    }

    pub fn catalog(&self) -> &ClipCatalog {
        &self.catalog
    }

    /// Stream of engine completion notifications, to be fed back into
    /// [`PlaybackSequencer::handle_completion`].
    pub fn completions(&self) -> Receiver<Completion> {
        self.completions_rx.clone()
    }

    /// Tears down any current playback and starts the first clip of
    /// `window`. An empty window leaves the sequencer idle.
    pub fn start(&self, window: PlaybackWindow) -> Result<()> {
        PlaybackWindow::new(window.start(), window.end(), self.catalog.len())?;

        let mut state = self.lock_state()?;
        self.teardown(&mut state);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if window.is_empty() {
            tracing::info!(start = window.start(), "empty clip window, nothing to play");
            return Ok(());
        }

        let mut active = self.prepare_now(window.start(), generation)?;
        active.start()?;
        let started_at = self.clock.now();
        let next = self.spawn_prefetch(&window, window.start() + 1, generation);

        tracing::info!(
            clip_index = window.start(),
            clip = self.clip_name(window.start()),
            end = window.end(),
            "clip window started"
        );

        *state = PlaybackState::Playing(ActivePlayback {
            window,
            generation,
            active,
            started_at,
            next,
        });
        Ok(())
    }

    /// Current clip and timing, or `None` while idle or between clips.
    pub fn current_position(&self) -> Result<Option<PlaybackPosition>> {
        let state = self.lock_state()?;
        let PlaybackState::Playing(playback) = &*state else {
            return Ok(None);
        };

        let clip_index = playback.active.clip_index();
        Ok(Some(PlaybackPosition {
            clip_index,
            clip_name: self.clip_name(clip_index).to_string(),
            media_position_millis: playback.active.position_millis().unwrap_or(0),
            elapsed_since_clip_start_millis: self.clock.elapsed(playback.started_at).as_millis()
                as u64,
        }))
    }

    pub fn current_track(&self) -> Result<Option<TrackDisplay>> {
        let state = self.lock_state()?;
        Ok(match &*state {
            PlaybackState::Idle | PlaybackState::Advancing { .. } => None,
            PlaybackState::Playing(playback) => {
                let clip_index = playback.active.clip_index();
                Some(TrackDisplay {
                    name: self.clip_name(clip_index).to_string(),
                    index: clip_index - playback.window.start(),
                    total: playback.window.len(),
                })
            }
        })
    }

    /// False while a clip plays or the next one is being brought up.
    pub fn is_idle(&self) -> bool {
        self.lock_state()
            .map(|state| matches!(*state, PlaybackState::Idle))
            .unwrap_or(true)
    }

    /// Advances past the active clip. Invoked when the engine reports that it
    /// reached its natural end.
    pub fn on_clip_completed(&self) -> Result<Transition> {
        let state = self.lock_state()?;
        self.advance(state)
    }

    /// Like [`PlaybackSequencer::on_clip_completed`], but only when the
    /// completion belongs to the clip that is currently playing.
    pub fn handle_completion(&self, completion: Completion) -> Result<Transition> {
        let state = self.lock_state()?;
        let current = match &*state {
            PlaybackState::Playing(playback) => Some((
                playback.generation,
                playback.active.clip_index(),
            )),
            PlaybackState::Idle | PlaybackState::Advancing { .. } => None,
        };

        if current != Some((completion.generation, completion.clip_index)) {
            tracing::debug!(?completion, "ignoring stale clip completion");
            return Ok(Transition::Ignored);
        }
        self.advance(state)
    }

    /// Releases the active and prefetched handles and returns to idle. A
    /// pending prefetch is waited for so its handle can be released too.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown(&mut state);
        Ok(())
    }

    fn advance(&self, mut state: MutexGuard<'_, PlaybackState<E>>) -> Result<Transition> {
        let mut playback = match std::mem::replace(&mut *state, PlaybackState::Idle) {
            PlaybackState::Playing(playback) => playback,
            other => {
                *state = other;
                return Ok(Transition::Ignored);
            }
        };

        let finished = playback.active.clip_index();
        playback.active.release();

        let next_index = finished + 1;
        if !playback.window.contains(next_index) {
            drop(state);
            release_prefetch(playback.next.take());
            tracing::info!(last_clip = finished, "clip window finished");
            return Ok(Transition::Finished);
        }

        let window = playback.window;
        let generation = playback.generation;
        *state = PlaybackState::Advancing {
            generation,
            clip_index: next_index,
        };
        drop(state);

        let prefetched = match playback.next.take() {
            Some(prefetch) if prefetch.clip_index() == next_index => prefetch.wait(),
            other => {
                release_prefetch(other);
                self.prepare_now(next_index, generation)
            }
        };

        let mut state = self.lock_state()?;
        let still_current = matches!(
            &*state,
            PlaybackState::Advancing { generation: g, clip_index, .. }
                if *g == generation && *clip_index == next_index
        );
        if !still_current {
            // Stopped or restarted while waiting; the new run owns the state.
            drop(state);
            drop(prefetched);
            tracing::debug!(clip_index = next_index, "discarding superseded prefetch");
            return Ok(Transition::Ignored);
        }
        *state = PlaybackState::Idle;

        let mut active = prefetched.map_err(|err| {
            tracing::error!(clip_index = next_index, %err, "aborting test, clip failed to prepare");
            err
        })?;
        active.start()?;
        let started_at = self.clock.now();
        let next = self.spawn_prefetch(&window, next_index + 1, generation);

        tracing::info!(
            clip_index = next_index,
            clip = self.clip_name(next_index),
            "advanced to next clip"
        );

        *state = PlaybackState::Playing(ActivePlayback {
            window,
            generation,
            active,
            started_at,
            next,
        });
        Ok(Transition::Advanced {
            clip_index: next_index,
        })
    }

    fn teardown(&self, state: &mut PlaybackState<E>) {
        match std::mem::replace(state, PlaybackState::Idle) {
            PlaybackState::Playing(mut playback) => {
                playback.active.release();
                release_prefetch(playback.next.take());
                tracing::info!(
                    clip_index = playback.active.clip_index(),
                    "playback stopped"
                );
            }
            // The advancing thread sees the state change and releases the
            // handle it is waiting for.
            PlaybackState::Advancing { clip_index, .. } => {
                tracing::info!(clip_index, "playback stopped while advancing");
            }
            PlaybackState::Idle => {}
        }
    }

    fn prepare_now(&self, clip_index: usize, generation: u64) -> Result<ClipPlayer<E>> {
        let clip = self
            .catalog
            .get(clip_index)
            .ok_or_else(|| LoggerError::msg(format!("clip {clip_index} not in catalog")))?;
        let signal = CompletionSignal::new(self.completions_tx.clone(), clip_index, generation);
        ClipPlayer::prepare(self.engine.clone(), clip, clip_index, signal)
    }

    fn spawn_prefetch(
        &self,
        window: &PlaybackWindow,
        clip_index: usize,
        generation: u64,
    ) -> Option<Prefetch<E>> {
        if !window.contains(clip_index) {
            return None;
        }
        let clip = self.catalog.get(clip_index)?.clone();
        let engine = self.engine.clone();
        let signal = CompletionSignal::new(self.completions_tx.clone(), clip_index, generation);
        let (tx, rx) = crossbeam_channel::bounded(1);

        let spawned = thread::Builder::new()
            .name(format!("clip-prefetch-{clip_index}"))
            .spawn(move || {
                tracing::debug!(clip_index, "prefetching clip");
                let prepared = ClipPlayer::prepare(engine, &clip, clip_index, signal);
                if let Err(err) = &prepared {
                    tracing::warn!(clip_index, %err, "prefetch failed");
                }
                // If the sequencer gave up on this prefetch the player is
                // dropped here, which releases it.
                let _ = tx.send(prepared);
            });

        match spawned {
            Ok(_) => Some(Prefetch::Pending { clip_index, rx }),
            Err(err) => {
                tracing::warn!(clip_index, %err, "prefetch thread unavailable, preparing inline");
                Some(Prefetch::Ready(self.prepare_now(clip_index, generation).ok()?))
            }
        }
    }

    fn clip_name(&self, clip_index: usize) -> &str {
        self.catalog
            .get(clip_index)
            .map(|clip| clip.display_name.as_str())
            .unwrap_or("")
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, PlaybackState<E>>> {
        self.state
            .lock()
            .map_err(|_| LoggerError::msg("playback state has been poisoned"))
    }
}

fn release_prefetch<E: PlaybackEngine>(prefetch: Option<Prefetch<E>>) {
    if let Some(prefetch) = prefetch {
        // A failed prepare has nothing to release.
        if let Ok(mut player) = prefetch.wait() {
            player.release();
        }
    }
}

impl<E: PlaybackEngine> fmt::Debug for PlaybackSequencer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSequencer")
            .field("clips", &self.catalog.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("idle", &self.is_idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{playback::mock::MockEngine, Clip, ClipSource, ManualClock};

    fn catalog(len: usize) -> Arc<ClipCatalog> {
        let clips = (0..len)
            .map(|i| {
                Clip::new(
                    format!("train/{i}.wav"),
                    ClipSource::new(format!("{i}.wav")),
                    format!("train_{i}"),
                )
            })
            .collect();
        Arc::new(ClipCatalog::new(clips))
    }

    fn build(len: usize) -> (PlaybackSequencer<MockEngine>, Arc<MockEngine>, Arc<ManualClock>) {
        let engine = Arc::new(MockEngine::new());
        let clock = Arc::new(ManualClock::new(0));
        let sequencer = PlaybackSequencer::new(catalog(len), engine.clone(), clock.clone());
        (sequencer, engine, clock)
    }

    fn run_to_idle(sequencer: &PlaybackSequencer<MockEngine>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        loop {
            let transition = sequencer.on_clip_completed().unwrap();
            transitions.push(transition);
            if !matches!(transition, Transition::Advanced { .. }) {
                return transitions;
            }
        }
    }

    #[test]
    fn rejects_invalid_windows() {
        assert!(matches!(
            PlaybackWindow::new(3, 2, 5),
            Err(LoggerError::InvalidRange { start: 3, end: 2, len: 5 })
        ));
        assert!(PlaybackWindow::new(0, 6, 5).is_err());
        assert_eq!(
            PlaybackWindow::from_bounds(None, None, 5).unwrap(),
            PlaybackWindow::full(5)
        );
    }

    #[test]
    fn start_rejects_window_built_for_larger_catalog() {
        let (sequencer, engine, _) = build(2);
        let window = PlaybackWindow::full(5);

        assert!(matches!(
            sequencer.start(window),
            Err(LoggerError::InvalidRange { .. })
        ));
        assert!(engine.state().prepared.is_empty());
    }

    #[test]
    fn plays_every_clip_in_window_once_in_order() {
        for (start, end) in [(0, 5), (1, 4), (4, 5), (0, 1)] {
            let (sequencer, engine, _) = build(5);
            sequencer.start(PlaybackWindow::new(start, end, 5).unwrap()).unwrap();

            let transitions = run_to_idle(&sequencer);

            assert_eq!(transitions.len(), end - start);
            assert_eq!(transitions.last(), Some(&Transition::Finished));
            let state = engine.state();
            assert_eq!(state.started, (start..end).collect::<Vec<_>>());
            assert_eq!(state.max_playing, 1);
            drop(state);
            assert!(sequencer.is_idle());
            assert_eq!(engine.live_handles(), 0);
        }
    }

    #[test]
    fn window_of_three_over_five_clips_idles_after_third() {
        let (sequencer, engine, _) = build(5);
        sequencer.start(PlaybackWindow::new(0, 3, 5).unwrap()).unwrap();

        assert_eq!(
            sequencer.on_clip_completed().unwrap(),
            Transition::Advanced { clip_index: 1 }
        );
        assert_eq!(
            sequencer.on_clip_completed().unwrap(),
            Transition::Advanced { clip_index: 2 }
        );
        assert_eq!(sequencer.on_clip_completed().unwrap(), Transition::Finished);
        assert_eq!(sequencer.current_position().unwrap(), None);
        assert_eq!(engine.state().prepared, vec![0, 1, 2]);
    }

    #[test]
    fn empty_window_stays_idle() {
        let (sequencer, engine, _) = build(5);
        sequencer.start(PlaybackWindow::new(2, 2, 5).unwrap()).unwrap();

        assert!(sequencer.is_idle());
        assert!(engine.state().started.is_empty());
        assert_eq!(sequencer.on_clip_completed().unwrap(), Transition::Ignored);
    }

    #[test]
    fn stop_releases_active_and_prefetched_handles() {
        let (sequencer, engine, _) = build(5);
        sequencer.start(PlaybackWindow::full(5)).unwrap();
        sequencer.on_clip_completed().unwrap();

        sequencer.stop().unwrap();
        sequencer.stop().unwrap();

        assert!(sequencer.is_idle());
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.playing_handles(), 0);
    }

    #[test]
    fn elapsed_is_measured_locally_and_resets_on_transition() {
        let (sequencer, engine, clock) = build(3);
        engine.state().position_millis = 7;
        sequencer.start(PlaybackWindow::full(3)).unwrap();

        clock.advance_millis(120);
        let first = sequencer.current_position().unwrap().unwrap();
        clock.advance_millis(30);
        let second = sequencer.current_position().unwrap().unwrap();

        assert_eq!(first.clip_index, 0);
        assert_eq!(first.clip_name, "train_0");
        assert_eq!(first.media_position_millis, 7);
        assert_eq!(first.elapsed_since_clip_start_millis, 120);
        assert_eq!(second.elapsed_since_clip_start_millis, 150);

        sequencer.on_clip_completed().unwrap();
        clock.advance_millis(10);
        let third = sequencer.current_position().unwrap().unwrap();
        assert_eq!(third.clip_index, 1);
        assert_eq!(third.elapsed_since_clip_start_millis, 10);
    }

    #[test]
    fn promotion_waits_for_slow_prefetch() {
        let (sequencer, engine, _) = build(3);
        sequencer.start(PlaybackWindow::full(3)).unwrap();
        engine.set_prepare_delay(Duration::from_millis(50));

        // Clip 1 was already prefetched; clip 2 is prepared slowly.
        assert_eq!(
            sequencer.on_clip_completed().unwrap(),
            Transition::Advanced { clip_index: 1 }
        );
        assert_eq!(
            sequencer.on_clip_completed().unwrap(),
            Transition::Advanced { clip_index: 2 }
        );
        assert_eq!(engine.state().started, vec![0, 1, 2]);
    }

    fn complete_in_background(
        sequencer: &Arc<PlaybackSequencer<MockEngine>>,
    ) -> thread::JoinHandle<Transition> {
        let sequencer = sequencer.clone();
        let handle = thread::spawn(move || sequencer.on_clip_completed().unwrap());
        // Let the completion reach the pending prefetch.
        thread::sleep(Duration::from_millis(50));
        handle
    }

    #[test]
    fn readers_do_not_wait_for_a_slow_prefetch() {
        let (sequencer, engine, _) = build(3);
        let sequencer = Arc::new(sequencer);
        engine.set_prepare_delay(Duration::from_millis(400));
        sequencer.start(PlaybackWindow::full(3)).unwrap();

        let advancing = complete_in_background(&sequencer);
        let asked = Instant::now();
        assert_eq!(sequencer.current_position().unwrap(), None);
        assert_eq!(sequencer.current_track().unwrap(), None);
        assert!(asked.elapsed() < Duration::from_millis(200));
        assert!(!sequencer.is_idle());

        assert_eq!(
            advancing.join().unwrap(),
            Transition::Advanced { clip_index: 1 }
        );
        assert_eq!(sequencer.current_position().unwrap().unwrap().clip_index, 1);
    }

    #[test]
    fn stop_while_advancing_discards_the_next_clip() {
        let (sequencer, engine, _) = build(3);
        let sequencer = Arc::new(sequencer);
        engine.set_prepare_delay(Duration::from_millis(300));
        sequencer.start(PlaybackWindow::full(3)).unwrap();

        let advancing = complete_in_background(&sequencer);
        sequencer.stop().unwrap();

        assert_eq!(advancing.join().unwrap(), Transition::Ignored);
        assert!(sequencer.is_idle());
        assert_eq!(engine.state().started, vec![0]);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn failed_prepare_on_start_leaves_idle() {
        let (sequencer, engine, _) = build(3);
        engine.fail_clip(0);

        let err = sequencer.start(PlaybackWindow::full(3)).unwrap_err();
        assert!(matches!(err, LoggerError::Prepare { .. }));
        assert!(sequencer.is_idle());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn failed_prefetch_aborts_on_transition() {
        let (sequencer, engine, _) = build(3);
        engine.fail_clip(1);
        sequencer.start(PlaybackWindow::full(3)).unwrap();

        let err = sequencer.on_clip_completed().unwrap_err();
        assert!(matches!(err, LoggerError::Prepare { .. }));
        assert!(sequencer.is_idle());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn stale_completions_are_ignored() {
        let (sequencer, engine, _) = build(3);
        sequencer.start(PlaybackWindow::full(3)).unwrap();
        let completions = sequencer.completions();

        sequencer.start(PlaybackWindow::new(1, 3, 3).unwrap()).unwrap();
        let stale = Completion {
            clip_index: 1,
            generation: 1,
        };
        assert_eq!(sequencer.handle_completion(stale).unwrap(), Transition::Ignored);

        assert!(engine.finish(1));
        let fresh = completions.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            sequencer.handle_completion(fresh).unwrap(),
            Transition::Advanced { clip_index: 2 }
        );
    }

    #[test]
    fn track_display_counts_from_window_start() {
        let (sequencer, _, _) = build(5);
        sequencer.start(PlaybackWindow::new(2, 5, 5).unwrap()).unwrap();
        sequencer.on_clip_completed().unwrap();

        let track = sequencer.current_track().unwrap().unwrap();
        assert_eq!(
            track,
            TrackDisplay {
                name: "train_3".to_string(),
                index: 1,
                total: 3
            }
        );
    }
}
