use std::collections::HashMap;

use parking_lot::Mutex;

use crate::capture::{SequenceId, StreamId};

/// Highest sequence id whose buffer has been delivered, per stream.
/// Never moves backwards.
#[derive(Debug, Default)]
pub struct StreamWatermarks {
    marks: Mutex<HashMap<StreamId, SequenceId>>,
}

impl StreamWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: StreamId) -> Option<SequenceId> {
        self.marks.lock().get(&stream_id).copied()
    }

    /// Returns false, leaving the mark untouched, if `sequence_id` is not
    /// above the current mark.
    pub fn advance(&self, stream_id: StreamId, sequence_id: SequenceId) -> bool {
        let mut marks = self.marks.lock();
        match marks.get(&stream_id) {
            Some(mark) if *mark >= sequence_id => false,
            _ => {
                marks.insert(stream_id, sequence_id);
                true
            }
        }
    }

    pub fn reset(&self) {
        self.marks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StreamClass;

    #[test]
    fn watermark_is_monotonic_per_stream() {
        let marks = StreamWatermarks::new();
        let preview = StreamId::new(StreamClass::Preview, 0).unwrap();
        let video = StreamId::new(StreamClass::Video, 0).unwrap();

        assert_eq!(marks.get(preview), None);
        assert!(marks.advance(preview, SequenceId(2)));
        assert!(!marks.advance(preview, SequenceId(2)));
        assert!(!marks.advance(preview, SequenceId(1)));
        assert!(marks.advance(video, SequenceId(1)));
        assert!(marks.advance(preview, SequenceId(5)));
        assert_eq!(marks.get(preview), Some(SequenceId(5)));
        assert_eq!(marks.get(video), Some(SequenceId(1)));

        marks.reset();
        assert_eq!(marks.get(preview), None);
    }
}
