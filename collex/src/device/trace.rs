use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a stream did, recorded when it actually happened on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// A task finished successfully.
    Task(&'static str),
    /// A notify was posted.
    Post(u32),
    /// A wait on a notify returned.
    WaitDone(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub seq: u64,
    pub stream: u32,
    pub kind: TraceKind,
}

/// Lock-free event log shared by any number of streams.
///
/// Sequence numbers are taken from one counter, so events of different
/// streams are totally ordered.
#[derive(Debug, Default)]
pub struct StreamTrace {
    seq: AtomicU64,
    events: SegQueue<TraceEvent>,
}

impl StreamTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, stream: u32, kind: TraceKind) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.events.push(TraceEvent { seq, stream, kind });
    }

    /// Take every recorded event, ordered by sequence number.
    pub fn drain(&self) -> Vec<TraceEvent> {
        let mut out = Vec::with_capacity(self.events.len());
        while let Some(ev) = self.events.pop() {
            out.push(ev);
        }
        out.sort_by_key(|e| e.seq);
        out
    }
}

/// Sequence number of the first event matching `pred`.
pub fn first_seq(events: &[TraceEvent], pred: impl Fn(&TraceEvent) -> bool) -> Option<u64> {
    events.iter().find(|e| pred(e)).map(|e| e.seq)
}
