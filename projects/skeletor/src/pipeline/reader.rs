// Reader worker: pulls frames from the source in order and feeds the work queue

use crate::pipeline::types::{ProcessingState, Task};
use crate::video::VideoReader;
use crossbeam::channel::{SendTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads frames sequentially and submits them with consecutive indices from 0.
///
/// Blocks in short bounded waits while the queue is full so the abort flag is
/// observed promptly. Returning drops `tx`, the only work sender, which is what
/// tells every worker that no more tasks will arrive.
pub fn read_worker(
    mut reader: Box<dyn VideoReader>,
    tx: Sender<Task>,
    state: Arc<ProcessingState>,
    poll: Duration,
) -> usize {
    let mut next_id = 0usize;

    'frames: loop {
        if state.is_aborted() {
            tracing::info!("Reader stopping: run aborted after {} frames", next_id);
            break;
        }

        let start_inst = Instant::now();
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    "Reader: failed to read frame {}, ending stream: {:#}",
                    next_id,
                    e
                );
                break;
            }
        };
        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;

        let mut task = Task { id: next_id, frame };
        loop {
            match tx.send_timeout(task, poll) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if state.is_aborted() {
                        break 'frames;
                    }
                    task = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => break 'frames,
            }
        }

        next_id += 1;
        state.frames_read.store(next_id, Ordering::Release);
        state.update_stage("reader", next_id, duration_ms);
    }

    if next_id < state.total_frames && !state.is_aborted() {
        tracing::warn!(
            "Reader: source ended after {} of {} advertised frames",
            next_id,
            state.total_frames
        );
    }
    tracing::debug!("Reader finished after {} frames", next_id);
    next_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::VideoMetadata;
    use anyhow::{anyhow, Result};
    use crossbeam::channel::bounded;
    use opencv::core::{self, Mat, Scalar};
    use opencv::prelude::*;

    struct CountingSource {
        produced: usize,
        fail_at: Option<usize>,
        total: usize,
    }

    impl VideoReader for CountingSource {
        fn metadata(&self) -> VideoMetadata {
            VideoMetadata {
                frame_count: self.total,
                fps: 30.0,
                width: 4,
                height: 4,
            }
        }

        fn next_frame(&mut self) -> Result<Option<Mat>> {
            if Some(self.produced) == self.fail_at {
                return Err(anyhow!("corrupt packet"));
            }
            if self.produced >= self.total {
                return Ok(None);
            }
            let value = self.produced as f64;
            self.produced += 1;
            Ok(Some(Mat::new_rows_cols_with_default(
                4,
                4,
                core::CV_8UC3,
                Scalar::all(value),
            )?))
        }
    }

    fn source(total: usize, fail_at: Option<usize>) -> Box<dyn VideoReader> {
        Box::new(CountingSource {
            produced: 0,
            fail_at,
            total,
        })
    }

    #[test]
    fn test_indices_are_consecutive_and_channel_closes() {
        let (tx, rx) = bounded(4);
        let state = Arc::new(ProcessingState::new(10));
        let reader_state = state.clone();
        let handle = std::thread::spawn(move || {
            read_worker(source(10, None), tx, reader_state, Duration::from_millis(5))
        });

        let ids: Vec<usize> = rx.iter().map(|task| task.id).collect();
        assert_eq!(handle.join().unwrap(), 10);
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert_eq!(state.frames_read.load(Ordering::Acquire), 10);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let (tx, rx) = bounded(16);
        let state = Arc::new(ProcessingState::new(10));
        let read = read_worker(source(10, Some(3)), tx, state, Duration::from_millis(5));
        assert_eq!(read, 3);
        let frames: Vec<Task> = rx.iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].frame.at_2d::<core::Vec3b>(0, 0).unwrap()[0], 2);
    }

    #[test]
    fn test_abort_unblocks_full_queue() {
        let (tx, rx) = bounded(1);
        let state = Arc::new(ProcessingState::new(100));
        let reader_state = state.clone();
        let handle = std::thread::spawn(move || {
            read_worker(source(100, None), tx, reader_state, Duration::from_millis(5))
        });

        // Queue holds one task; the reader is now blocked on the second
        std::thread::sleep(Duration::from_millis(50));
        state.request_abort("test");
        let read = handle.join().unwrap();
        assert!(read <= 2);
        drop(rx);
    }
}
