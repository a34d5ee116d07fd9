use crate::error::SinkError;
use crate::pipeline::reassembly::ReorderBuffer;
use crate::pipeline::types::{FrameOutcome, FrameResult, ProcessingState};
use crate::video::encoder::FrameSink;
use indicatif::ProgressBar;
use opencv::prelude::*;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Writer side of the pipeline: parks out-of-order results and streams every
/// contiguous run starting at the cursor into the sink.
pub struct OrderedWriter {
    buffer: ReorderBuffer<FrameOutcome>,
}

impl Default for OrderedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedWriter {
    pub fn new() -> Self {
        Self {
            buffer: ReorderBuffer::new(),
        }
    }

    pub fn accept(&mut self, result: FrameResult) {
        let id = result.id;
        if !self.buffer.insert(id, result.outcome) {
            tracing::warn!("Dropping duplicate or stale result for frame {}", id);
        }
    }

    /// Write every result that is now in order. Stops at the first sink error,
    /// leaving the failed frame consumed and the rest parked.
    pub fn flush_ready(
        &mut self,
        sink: &mut dyn FrameSink,
        state: &ProcessingState,
        pb: &ProgressBar,
    ) -> Result<usize, SinkError> {
        let mut written = 0;
        while let Some((id, outcome)) = self.buffer.pop_next() {
            let start_inst = Instant::now();
            if outcome.is_recovered() {
                tracing::debug!("Writing blank placeholder for frame {}", id);
            }
            let frame = outcome.frame();
            // Non-continuous or empty Mats surface as a geometry error in the sink
            let bytes: &[u8] = if frame.is_continuous() {
                frame.data_bytes().unwrap_or_default()
            } else {
                &[]
            };
            sink.write_frame(bytes).map_err(|e| {
                tracing::error!("Sink rejected frame {}: {}", id, e);
                e
            })?;

            written += 1;
            let total_written = state.frames_written.fetch_add(1, Ordering::AcqRel) + 1;
            state.update_stage(
                "write",
                total_written,
                start_inst.elapsed().as_secs_f64() * 1000.0,
            );
            pb.inc(1);
        }
        Ok(written)
    }

    /// Next frame index the sink expects.
    pub fn cursor(&self) -> usize {
        self.buffer.cursor()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn first_pending(&self) -> Option<usize> {
        self.buffer.first_pending()
    }

    /// Drop parked results without writing them.
    pub fn discard(&mut self) -> usize {
        self.buffer.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::masking::blank_frame;
    use crate::video::encoder::SinkStatus;

    struct CountingSink {
        sizes: Vec<usize>,
        fail_on_call: Option<usize>,
    }

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError> {
            if Some(self.sizes.len()) == self.fail_on_call {
                return Err(SinkError::BrokenPipe(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "closed",
                )));
            }
            self.sizes.push(frame.len());
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<SinkStatus, SinkError> {
            Ok(SinkStatus::default())
        }
    }

    fn result(id: usize) -> FrameResult {
        FrameResult {
            id,
            outcome: FrameOutcome::Processed(blank_frame(2, 2).unwrap()),
        }
    }

    #[test]
    fn test_flush_waits_for_cursor() {
        let state = ProcessingState::new(3);
        let pb = ProgressBar::hidden();
        let mut sink = CountingSink {
            sizes: Vec::new(),
            fail_on_call: None,
        };
        let mut writer = OrderedWriter::new();

        writer.accept(result(2));
        writer.accept(result(1));
        assert_eq!(writer.flush_ready(&mut sink, &state, &pb).unwrap(), 0);
        assert_eq!(writer.first_pending(), Some(1));

        writer.accept(result(0));
        assert_eq!(writer.flush_ready(&mut sink, &state, &pb).unwrap(), 3);
        assert_eq!(sink.sizes, vec![16, 16, 16]);
        assert_eq!(writer.cursor(), 3);
        assert_eq!(state.frames_written.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_sink_error_stops_flush() {
        let state = ProcessingState::new(4);
        let pb = ProgressBar::hidden();
        let mut sink = CountingSink {
            sizes: Vec::new(),
            fail_on_call: Some(1),
        };
        let mut writer = OrderedWriter::new();
        for id in 0..4 {
            writer.accept(result(id));
        }

        let err = writer.flush_ready(&mut sink, &state, &pb).unwrap_err();
        assert!(matches!(err, SinkError::BrokenPipe(_)));
        assert_eq!(state.frames_written.load(Ordering::Acquire), 1);
        assert_eq!(writer.pending(), 2);
        assert_eq!(writer.discard(), 2);
    }
}
