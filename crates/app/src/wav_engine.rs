use std::{
    fs::File,
    io::BufReader,
    thread,
    time::{Duration, Instant},
};

use accel_logger_core::{Clip, CompletionSignal, LoggerError, PlaybackEngine, Result};
use crossbeam_channel::{after, select, Sender};

/// Playback engine that does not produce sound: it opens each WAV file to
/// learn its duration and reports completion once that much time has passed.
/// Good enough to drive a test run on machines without the target device.
#[derive(Debug, Default)]
pub struct WavTimerEngine;

pub struct WavHandle {
    _reader: hound::WavReader<BufReader<File>>,
    duration: Duration,
    started_at: Option<Instant>,
    completion: CompletionSignal,
    cancel: Option<Sender<()>>,
}

impl PlaybackEngine for WavTimerEngine {
    type Handle = WavHandle;

    fn prepare(&self, clip: &Clip, completion: CompletionSignal) -> Result<WavHandle> {
        let reader = hound::WavReader::open(&clip.source.path)
            .map_err(|err| LoggerError::prepare(&clip.id, err))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(LoggerError::prepare(&clip.id, "zero sample rate"));
        }
        let duration =
            Duration::from_secs_f64(f64::from(reader.duration()) / f64::from(spec.sample_rate));
        tracing::debug!(clip = %clip.display_name, ?duration, "clip prepared");

        Ok(WavHandle {
            _reader: reader,
            duration,
            started_at: None,
            completion,
            cancel: None,
        })
    }

    fn start(&self, handle: &mut WavHandle) -> Result<()> {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let completion = handle.completion.clone();
        let timeout = after(handle.duration);

        thread::Builder::new()
            .name(format!("clip-timer-{}", completion.clip_index()))
            .spawn(move || {
                let finished = select! {
                    recv(cancel_rx) -> _ => false,
                    recv(timeout) -> _ => true,
                };
                if finished {
                    completion.notify();
                }
            })?;

        handle.cancel = Some(cancel_tx);
        handle.started_at = Some(Instant::now());
        Ok(())
    }

    fn current_position_millis(&self, handle: &WavHandle) -> u64 {
        handle
            .started_at
            .map(|started| started.elapsed().min(handle.duration).as_millis() as u64)
            .unwrap_or(0)
    }

    fn is_playing(&self, handle: &WavHandle) -> bool {
        handle.cancel.is_some()
            && handle
                .started_at
                .map(|started| started.elapsed() < handle.duration)
                .unwrap_or(false)
    }

    fn stop(&self, handle: &mut WavHandle) {
        // Dropping the sender wakes the timer thread without a completion.
        handle.cancel.take();
    }

    fn reset(&self, handle: &mut WavHandle) {
        handle.started_at = None;
    }

    fn release(&self, handle: WavHandle) {
        drop(handle);
    }
}
