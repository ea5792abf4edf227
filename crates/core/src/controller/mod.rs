//! Operator-facing control surface for test runs.

use std::{
    fmt, fs,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{
    acquisition::publish, log_file_name, AcquisitionCore, AppConfig, ClipCatalog, Completion,
    LogConfig, LoggerError, Notice, PlaybackEngine, PlaybackSequencer, PlaybackWindow,
    RateEstimate, RecordWriter, Result, SensorSample, SharedClock, TrackDisplay, Transition,
};

const NOTICE_CAPACITY: usize = 256;
const STANDBY: &str = "Standby";

#[derive(Debug, Clone)]
struct ActiveTest {
    window: PlaybackWindow,
    log_path: PathBuf,
}

/// Owns the components of one recording setup and exposes the operations an
/// operator needs: start and end a test, and read the live rate and track.
pub struct TestController<E: PlaybackEngine> {
    log: LogConfig,
    sequencer: Arc<PlaybackSequencer<E>>,
    acquisition: Arc<AcquisitionCore<E>>,
    notices_rx: Receiver<Notice>,
    test: Mutex<Option<ActiveTest>>,
    shutdown_tx: Option<Sender<()>>,
    listener: Option<JoinHandle<()>>,
}

impl<E: PlaybackEngine> TestController<E> {
    pub fn new(
        catalog: ClipCatalog,
        engine: Arc<E>,
        clock: SharedClock,
        config: &AppConfig,
    ) -> Result<Self> {
        config.validate()?;

        let sequencer = Arc::new(PlaybackSequencer::new(
            Arc::new(catalog),
            engine,
            clock.clone(),
        ));
        let (notices_tx, notices_rx) = crossbeam_channel::bounded(NOTICE_CAPACITY);
        let acquisition = Arc::new(AcquisitionCore::new(
            sequencer.clone(),
            clock,
            config.sensor.rate_batch_size,
            config.log.failure_threshold,
            notices_tx.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let listener = {
            let sequencer = sequencer.clone();
            let completions = sequencer.completions();
            thread::Builder::new()
                .name("clip-completions".into())
                .spawn(move || completion_loop(sequencer, completions, shutdown_rx, notices_tx))?
        };

        Ok(Self {
            log: config.log.clone(),
            sequencer,
            acquisition,
            notices_rx,
            test: Mutex::new(None),
            shutdown_tx: Some(shutdown_tx),
            listener: Some(listener),
        })
    }

    pub fn catalog(&self) -> &ClipCatalog {
        self.sequencer.catalog()
    }

    /// Operator notifications: rate updates, append failures, test end.
    pub fn notices(&self) -> Receiver<Notice> {
        self.notices_rx.clone()
    }

    /// Builds a window from optional bounds, defaulting to the whole catalog.
    pub fn window(&self, start: Option<usize>, end: Option<usize>) -> Result<PlaybackWindow> {
        PlaybackWindow::from_bounds(start, end, self.catalog().len())
    }

    /// Opens a fresh log file and starts playing `window`. Any running test is
    /// ended first. On failure nothing is left running and the new log file is
    /// removed.
    pub fn start_test(&self, window: PlaybackWindow) -> Result<PathBuf> {
        PlaybackWindow::new(window.start(), window.end(), self.catalog().len())?;

        let mut test = self.lock_test()?;
        self.finish_test(&mut test)?;

        let file_name = log_file_name(&self.log.device_identity, &chrono::Local::now());
        let writer = RecordWriter::create_unique(
            self.log.output_dir.join(file_name),
            self.log.sync_interval,
        )?;
        let log_path = writer.path().to_path_buf();
        if let Some(stale) = self.acquisition.attach_writer(writer)? {
            stale.close()?;
        }

        if let Err(err) = self.sequencer.start(window) {
            tracing::error!(%err, "test aborted before it started");
            if let Some(writer) = self.acquisition.detach_writer()? {
                let path = writer.close()?;
                let _ = fs::remove_file(path);
            }
            return Err(err);
        }

        tracing::info!(
            ?log_path,
            start = window.start(),
            end = window.end(),
            "test started"
        );
        *test = Some(ActiveTest {
            window,
            log_path: log_path.clone(),
        });
        Ok(log_path)
    }

    /// Stops playback and closes the log. Returns the log path when a test was
    /// running.
    pub fn end_test(&self) -> Result<Option<PathBuf>> {
        let mut test = self.lock_test()?;
        self.finish_test(&mut test)
    }

    /// True from a successful [`TestController::start_test`] until
    /// [`TestController::end_test`]. A window that finishes or aborts keeps
    /// the test running so motion after the last clip is still logged.
    pub fn is_test_running(&self) -> bool {
        self.lock_test().map(|test| test.is_some()).unwrap_or(false)
    }

    /// True while a clip from the current window is playing.
    pub fn is_playing(&self) -> bool {
        !self.sequencer.is_idle()
    }

    /// Latest sampling-rate estimate; zero until the first batch completes.
    pub fn current_rate(&self) -> RateEstimate {
        self.acquisition.current_rate().unwrap_or_default()
    }

    pub fn current_track_display(&self) -> Result<TrackDisplay> {
        if let Some(track) = self.sequencer.current_track()? {
            return Ok(track);
        }
        let total = self
            .lock_test()?
            .as_ref()
            .map(|test| test.window.len())
            .unwrap_or_else(|| self.catalog().len());
        Ok(TrackDisplay {
            name: STANDBY.to_string(),
            index: 0,
            total,
        })
    }

    /// Sensor callback entry point.
    pub fn on_sensor_event(&self, sample: SensorSample) {
        self.acquisition.on_sensor_event(sample);
    }

    fn finish_test(&self, test: &mut Option<ActiveTest>) -> Result<Option<PathBuf>> {
        self.sequencer.stop()?;
        let closed = match self.acquisition.detach_writer()? {
            Some(writer) => Some(writer.close()?),
            None => None,
        };
        if let Some(ended) = test.take() {
            tracing::info!(log_path = ?ended.log_path, "test ended");
        }
        Ok(closed)
    }

    fn lock_test(&self) -> Result<MutexGuard<'_, Option<ActiveTest>>> {
        self.test
            .lock()
            .map_err(|_| LoggerError::msg("test state has been poisoned"))
    }
}

fn completion_loop<E: PlaybackEngine>(
    sequencer: Arc<PlaybackSequencer<E>>,
    completions: Receiver<Completion>,
    shutdown: Receiver<()>,
    notices: Sender<Notice>,
) {
    loop {
        let completion = select! {
            recv(completions) -> completion => completion.ok(),
            recv(shutdown) -> _ => None,
        };
        let Some(completion) = completion else {
            break;
        };

        match sequencer.handle_completion(completion) {
            Ok(Transition::Finished) => publish(&notices, Notice::TestFinished),
            Ok(_) => {}
            Err(err) => publish(
                &notices,
                Notice::TestAborted {
                    reason: err.to_string(),
                },
            ),
        }
    }
    tracing::debug!("completion listener stopped");
}

impl<E: PlaybackEngine> Drop for TestController<E> {
    fn drop(&mut self) {
        if let Err(err) = self.end_test() {
            tracing::warn!(%err, "failed to end test on shutdown");
        }
        // Disconnecting the shutdown channel wakes the listener.
        self.shutdown_tx.take();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

impl<E: PlaybackEngine> fmt::Debug for TestController<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestController")
            .field("sequencer", &self.sequencer)
            .field("acquisition", &self.acquisition)
            .field("test_running", &self.is_test_running())
            .finish()
    }
}
