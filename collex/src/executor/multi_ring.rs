//! Fan one operation out over several rings and back in.
//!
//! With `R` rings, ring `r < R - 1` runs on auxiliary stream `r` and the
//! last ring runs on the caller's primary stream:
//!
//! ```text
//! primary: empty | post start[0..R-1] | ring R-1 | wait done[0..R-1] | empty
//! aux r:   wait start[r] | ring r | post done[r]
//! ```
//!
//! Nothing the primary stream enqueues after the fan-in runs before every
//! auxiliary ring has posted its "done".

use crate::algorithm::{
    KernelArgs, RingAllGather, RingAllReduce, RingGather, RingReduceScatter, RingScatter, launch,
};
use crate::device::{DeviceMem, Notify, RingContext, Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::resource::{CommLevel, ResourceResponse};
use crate::slice::{MultiRingSlices, Slice, multi_seg_slices, prepare_multi_ring_slice};
use crate::types::{DataType, ReduceOp};
use std::time::Duration;

/// Start/done notifies between the primary stream and one auxiliary stream.
#[derive(Debug, Clone)]
pub struct SignalPair {
    start: Notify,
    done: Notify,
}

/// Handed out by [`SignalPair::wait_start`] and consumed by
/// [`SignalPair::post_done`], so "done" cannot be posted on a stream that
/// was never told to wait for "start".
#[must_use]
#[derive(Debug)]
pub struct StartedRing {
    ring: usize,
}

impl StartedRing {
    pub fn ring(&self) -> usize {
        self.ring
    }
}

impl SignalPair {
    pub fn new(done: Notify, start: Notify) -> Self {
        Self { start, done }
    }

    pub fn start(&self) -> &Notify {
        &self.start
    }

    pub fn done(&self) -> &Notify {
        &self.done
    }

    /// Hold `aux` until the primary stream posts "start".
    pub fn wait_start(&self, aux: &Stream, ring: usize, timeout: Duration) -> Result<StartedRing> {
        aux.wait(&self.start, timeout)?;
        Ok(StartedRing { ring })
    }

    pub fn post_start(&self, primary: &Stream) -> Result<()> {
        primary.post(&self.start)
    }

    pub fn post_done(&self, aux: &Stream, started: StartedRing) -> Result<()> {
        tracing::trace!(ring = started.ring, notify = self.done.id(), "multi_ring: post done");
        aux.post(&self.done)
    }

    pub fn wait_done(&self, primary: &Stream, timeout: Duration) -> Result<()> {
        primary.wait(&self.done, timeout)
    }
}

/// Auxiliary streams of one executor plus one signal pair per stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSyncSet {
    streams: Vec<Stream>,
    signals: Vec<SignalPair>,
}

impl StreamSyncSet {
    /// Pair stream `i` with `notifies[2i]` (done) and `notifies[2i + 1]`
    /// (start).
    pub fn new(streams: Vec<Stream>, notifies: &[Notify]) -> Result<Self> {
        if notifies.len() < 2 * streams.len() {
            return Err(CollexError::internal(format!(
                "{} notifies for {} auxiliary streams",
                notifies.len(),
                streams.len()
            )));
        }
        let signals = (0..streams.len())
            .map(|i| SignalPair::new(notifies[2 * i].clone(), notifies[2 * i + 1].clone()))
            .collect();
        Ok(Self { streams, signals })
    }

    pub fn from_response(resp: &ResourceResponse) -> Result<Self> {
        Self::new(resp.streams.clone(), &resp.notifies)
    }

    /// Rings this set can drive: one per auxiliary stream plus the primary.
    pub fn ring_num(&self) -> usize {
        self.streams.len() + 1
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn signals(&self) -> &[SignalPair] {
        &self.signals
    }
}

/// One plane a ring runs on, with its member devices in ring order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPlane {
    pub level: CommLevel,
    pub index: usize,
    pub order: Vec<u32>,
}

impl RingPlane {
    pub fn new(level: CommLevel, index: usize, order: Vec<u32>) -> Self {
        Self { level, index, order }
    }

    /// Ring position (sub-rank) of `device`.
    pub fn position_of(&self, device: u32) -> Result<usize> {
        self.order.iter().position(|&d| d == device).ok_or_else(|| {
            CollexError::internal(format!(
                "device {device} is not on {} plane {} ({:?})",
                self.level, self.index, self.order
            ))
        })
    }
}

/// One ring's share of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingLayout {
    pub slices: Vec<Slice>,
    /// Ring position owning each slice; `None` when slice `k` belongs to
    /// position `k`.
    pub owners: Option<Vec<usize>>,
}

impl RingLayout {
    fn new(slices: Vec<Slice>, owners: Vec<usize>) -> Self {
        let identity = owners.iter().enumerate().all(|(k, &o)| k == o) && owners.len() == slices.len();
        Self {
            slices,
            owners: (!identity).then_some(owners),
        }
    }

    pub fn args(&self, input: DeviceMem, output: DeviceMem, dtype: DataType) -> KernelArgs {
        let args = KernelArgs::new(input, output, dtype).slices(self.slices.clone());
        match &self.owners {
            Some(o) => args.owners(o.clone()),
            None => args,
        }
    }
}

/// Split per-device `segments` across `rings` for collectives where every
/// slice has one owning ring position (all-gather, reduce-scatter,
/// all-reduce).
///
/// `segments[d]` is device `d`'s block. With several rings only NIC-bearing
/// positions carry slices; the split is returned alongside so the caller can
/// record the NIC bookkeeping.
pub fn owned_layouts(
    segments: &[Slice],
    rings: &[RingPlane],
    nics: &[u32],
) -> Result<(Vec<RingLayout>, Option<MultiRingSlices>)> {
    let Some(first) = rings.first() else {
        return Err(CollexError::internal("no rings to lay out"));
    };
    if segments.len() != first.order.len() {
        return Err(CollexError::internal(format!(
            "{} segments for rings of {} devices",
            segments.len(),
            first.order.len()
        )));
    }
    if rings.len() == 1 {
        let owners = (0..segments.len() as u32)
            .map(|d| first.position_of(d))
            .collect::<Result<Vec<_>>>()?;
        return Ok((vec![RingLayout::new(segments.to_vec(), owners)], None));
    }

    let orders: Vec<Vec<u32>> = rings.iter().map(|r| r.order.clone()).collect();
    let split = prepare_multi_ring_slice(segments, &orders, nics, false)?;
    let mut sorted = nics.to_vec();
    sorted.sort_unstable();
    let chunk = first.order.len() / sorted.len();

    let mut layouts = Vec::with_capacity(rings.len());
    for (r, ring) in rings.iter().enumerate() {
        let mut owners = Vec::with_capacity(split.slices[r].len());
        for &pos in &split.ring_nics[r] {
            let nic_pos = sorted
                .iter()
                .position(|&n| n == ring.order[pos])
                .ok_or_else(|| CollexError::internal(format!("ring position {pos} has no nic")))?;
            for c in 0..chunk {
                owners.push(ring.position_of((nic_pos * chunk + c) as u32)?);
            }
        }
        layouts.push(RingLayout::new(split.slices[r].clone(), owners));
    }
    Ok((layouts, Some(split)))
}

/// Split per-device `segments` across `rings` for rooted collectives:
/// ring `r` carries piece `r` of every segment, indexed by ring position.
pub fn positional_layouts(segments: &[Slice], rings: &[RingPlane]) -> Result<Vec<Vec<Slice>>> {
    let pieces = multi_seg_slices(segments, rings.len())?;
    rings
        .iter()
        .enumerate()
        .map(|(r, ring)| {
            ring.order
                .iter()
                .map(|&d| {
                    pieces
                        .get(d as usize)
                        .map(|p| p[r])
                        .ok_or_else(|| CollexError::internal(format!("no segment for device {d}")))
                })
                .collect()
        })
        .collect()
}

/// Drives one fan-out/fan-in over the streams of a [`StreamSyncSet`].
pub struct MultiRing<'a> {
    tag: &'a str,
    primary: &'a Stream,
    sync: &'a StreamSyncSet,
    wait_timeout: Duration,
}

impl<'a> MultiRing<'a> {
    pub fn new(tag: &'a str, primary: &'a Stream, sync: &'a StreamSyncSet, wait_timeout: Duration) -> Self {
        Self {
            tag,
            primary,
            sync,
            wait_timeout,
        }
    }

    pub fn primary(&self) -> &Stream {
        self.primary
    }

    fn ring_stream(&self, stream: &Stream, ring: usize, stream_index: usize) -> Stream {
        stream.in_ring(RingContext {
            tag: self.tag.to_string(),
            ring,
            stream: stream_index,
        })
    }

    /// Run `per_ring(ring, stream)` for `ring_num` rings.
    ///
    /// `per_ring` only enqueues; failures of what it enqueued surface as
    /// `RingFailed` on that ring's stream and, for auxiliary rings, as a
    /// failed fan-in wait on the primary stream.
    pub fn run<F>(&self, ring_num: usize, mut per_ring: F) -> Result<()>
    where
        F: FnMut(usize, &Stream) -> Result<()>,
    {
        if ring_num == 0 {
            return Err(CollexError::internal(format!("tag {}: zero rings", self.tag)));
        }
        let aux = ring_num - 1;
        if aux > self.sync.streams.len() {
            return Err(CollexError::internal(format!(
                "tag {}: {ring_num} rings need {aux} auxiliary streams, {} bound",
                self.tag,
                self.sync.streams.len()
            )));
        }
        if aux == 0 {
            return per_ring(0, &self.ring_stream(self.primary, 0, 0));
        }

        tracing::debug!(tag = %self.tag, rings = ring_num, "multi_ring: fan out");
        self.primary.empty_task()?;
        for ring in 0..aux {
            let stream = &self.sync.streams[ring];
            let signal = &self.sync.signals[ring];
            let started = signal.wait_start(stream, ring, self.wait_timeout)?;
            per_ring(ring, &self.ring_stream(stream, ring, ring + 1))?;
            signal.post_done(stream, started)?;
            signal.post_start(self.primary)?;
        }
        per_ring(aux, &self.ring_stream(self.primary, aux, 0))?;
        for signal in &self.sync.signals[..aux] {
            signal.wait_done(self.primary, self.wait_timeout)?;
        }
        self.primary.empty_task()
    }

    /// All-gather of `buf` on every ring.
    pub fn all_gather(
        &self,
        resp: &ResourceResponse,
        rings: &[RingPlane],
        layouts: &[RingLayout],
        buf: &DeviceMem,
        dtype: DataType,
    ) -> Result<()> {
        check_rings(rings, layouts.len())?;
        self.run(rings.len(), |r, stream| {
            let view = resp.sub_comm(rings[r].level, rings[r].index)?;
            let args = layouts[r].args(buf.clone(), buf.clone(), dtype);
            launch(Box::new(RingAllGather::new()), args, &view, stream)
        })
    }

    /// Reduce-scatter in place in `input`; owned slices land in `output`.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce_scatter(
        &self,
        resp: &ResourceResponse,
        rings: &[RingPlane],
        layouts: &[RingLayout],
        input: &DeviceMem,
        output: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
        attr: u64,
    ) -> Result<()> {
        check_rings(rings, layouts.len())?;
        self.run(rings.len(), |r, stream| {
            let view = resp.sub_comm(rings[r].level, rings[r].index)?;
            let args = layouts[r]
                .args(input.clone(), output.clone(), dtype)
                .reduce(op)
                .attr(attr);
            launch(Box::new(RingReduceScatter::new()), args, &view, stream)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn all_reduce(
        &self,
        resp: &ResourceResponse,
        rings: &[RingPlane],
        layouts: &[RingLayout],
        input: &DeviceMem,
        output: &DeviceMem,
        dtype: DataType,
        op: ReduceOp,
        attr: u64,
    ) -> Result<()> {
        check_rings(rings, layouts.len())?;
        // rings share the output, so each copies in only its own slices
        self.run(rings.len(), |r, stream| {
            let view = resp.sub_comm(rings[r].level, rings[r].index)?;
            let args = layouts[r]
                .args(output.clone(), output.clone(), dtype)
                .reduce(op)
                .attr(attr);
            for s in &layouts[r].slices {
                copy_async(&output.range(s.offset, s.size)?, &input.range(s.offset, s.size)?, stream)?;
            }
            launch(Box::new(RingAllReduce::new()), args, &view, stream)
        })
    }

    /// Scatter from `root_device`: `slices[r][p]` is what ring `r` delivers
    /// to position `p`, at the same offset of `buf` on every device.
    pub fn scatter(
        &self,
        resp: &ResourceResponse,
        rings: &[RingPlane],
        slices: &[Vec<Slice>],
        buf: &DeviceMem,
        dtype: DataType,
        root_device: u32,
    ) -> Result<()> {
        check_rings(rings, slices.len())?;
        self.run(rings.len(), |r, stream| {
            let view = resp.sub_comm(rings[r].level, rings[r].index)?;
            let root = rings[r].position_of(root_device)? as u32;
            let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                .slices(slices[r].clone())
                .root(root);
            launch(Box::new(RingScatter::new()), args, &view, stream)
        })
    }

    /// Inverse of [`MultiRing::scatter`].
    pub fn gather(
        &self,
        resp: &ResourceResponse,
        rings: &[RingPlane],
        slices: &[Vec<Slice>],
        buf: &DeviceMem,
        dtype: DataType,
        root_device: u32,
    ) -> Result<()> {
        check_rings(rings, slices.len())?;
        self.run(rings.len(), |r, stream| {
            let view = resp.sub_comm(rings[r].level, rings[r].index)?;
            let root = rings[r].position_of(root_device)? as u32;
            let args = KernelArgs::new(buf.clone(), buf.clone(), dtype)
                .slices(slices[r].clone())
                .root(root);
            launch(Box::new(RingGather::new()), args, &view, stream)
        })
    }
}

fn check_rings(rings: &[RingPlane], layouts: usize) -> Result<()> {
    if rings.is_empty() || rings.len() != layouts {
        return Err(CollexError::internal(format!(
            "{} rings for {layouts} layouts",
            rings.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{StreamTrace, TraceKind, trace::first_seq};
    use crate::slice::{check_partition, rank_slices};
    use crate::topology::RING_8P_ORDERS;
    use std::sync::Arc;

    fn sync_set(trace: &Arc<StreamTrace>, aux: usize) -> StreamSyncSet {
        let streams = (0..aux)
            .map(|i| Stream::with_trace(10 + i as u32, Arc::clone(trace)).unwrap())
            .collect();
        let notifies: Vec<Notify> = (0..2 * aux).map(|i| Notify::new(100 + i as u32)).collect();
        StreamSyncSet::new(streams, &notifies).unwrap()
    }

    #[tokio::test]
    async fn test_fan_in_waits_for_every_done() {
        let trace = Arc::new(StreamTrace::new());
        let primary = Stream::with_trace(0, Arc::clone(&trace)).unwrap();
        let sync = sync_set(&trace, 3);
        let mr = MultiRing::new("t", &primary, &sync, Duration::from_secs(5));
        mr.run(4, |ring, stream| {
            stream.enqueue("ring", async move {
                // later rings finish first
                tokio::time::sleep(Duration::from_millis(5 * (4 - ring as u64))).await;
                Ok(())
            })
        })
        .unwrap();
        primary.synchronize().await.unwrap();
        let events = trace.drain();

        let last_primary = events
            .iter()
            .filter(|e| e.stream == 0)
            .map(|e| e.seq)
            .max()
            .unwrap();
        for (i, signal) in sync.signals().iter().enumerate() {
            let done = signal.done().id();
            let start = signal.start().id();
            let posted = first_seq(&events, |e| e.kind == TraceKind::Post(done)).unwrap();
            let waited = first_seq(&events, |e| e.kind == TraceKind::WaitDone(done) && e.stream == 0).unwrap();
            assert!(posted < waited, "ring {i}: done waited before posted");
            assert!(waited < last_primary);
            let started = first_seq(&events, |e| e.kind == TraceKind::WaitDone(start)).unwrap();
            let ran = first_seq(&events, |e| e.stream == 10 + i as u32 && e.kind == TraceKind::Task("ring")).unwrap();
            assert!(started < ran, "ring {i} ran before start");
        }
    }

    #[tokio::test]
    async fn test_single_ring_posts_nothing() {
        let trace = Arc::new(StreamTrace::new());
        let primary = Stream::with_trace(0, Arc::clone(&trace)).unwrap();
        let sync = StreamSyncSet::default();
        let mr = MultiRing::new("t", &primary, &sync, Duration::from_secs(1));
        mr.run(1, |_, s| s.enqueue("ring", async { Ok(()) })).unwrap();
        primary.synchronize().await.unwrap();
        let events = trace.drain();
        assert!(events.iter().all(|e| matches!(e.kind, TraceKind::Task(_))));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_aux_failure_is_ring_failed() {
        let primary = Stream::new(0).unwrap();
        let trace = Arc::new(StreamTrace::new());
        let sync = sync_set(&trace, 2);
        let mr = MultiRing::new("ag_tag", &primary, &sync, Duration::from_secs(5));
        mr.run(3, |ring, stream| {
            stream.enqueue("ring", async move {
                if ring == 1 {
                    return Err(CollexError::transport("link reset"));
                }
                Ok(())
            })
        })
        .unwrap();

        let err = primary.synchronize().await.unwrap_err();
        assert!(err.to_string().contains("ring 1"), "{err}");
        let aux_err = sync.streams()[1].synchronize().await.unwrap_err();
        match aux_err {
            CollexError::RingFailed { tag, ring, stream, .. } => {
                assert_eq!(tag, "ag_tag");
                assert_eq!(ring, 1);
                assert_eq!(stream, 2);
            }
            other => panic!("expected RingFailed, got {other:?}"),
        }
        assert!(sync.streams()[0].synchronize().await.is_ok());
    }

    #[tokio::test]
    async fn test_too_few_streams() {
        let primary = Stream::new(0).unwrap();
        let trace = Arc::new(StreamTrace::new());
        let sync = sync_set(&trace, 1);
        let mr = MultiRing::new("t", &primary, &sync, Duration::from_secs(1));
        assert!(mr.run(3, |_, _| Ok(())).is_err());
        assert!(mr.run(0, |_, _| Ok(())).is_err());
    }

    #[tokio::test]
    async fn test_too_few_notifies() {
        let streams = vec![Stream::new(1).unwrap()];
        assert!(StreamSyncSet::new(streams.clone(), &[Notify::new(1)]).is_err());
        let set = StreamSyncSet::new(streams, &[Notify::new(1), Notify::new(2)]).unwrap();
        assert_eq!(set.ring_num(), 2);
        assert_eq!(set.signals()[0].done().id(), 1);
        assert_eq!(set.signals()[0].start().id(), 2);
    }

    fn rings_8p() -> Vec<RingPlane> {
        RING_8P_ORDERS
            .iter()
            .enumerate()
            .map(|(i, o)| RingPlane::new(CommLevel::Level0, i, o.to_vec()))
            .collect()
    }

    #[test]
    fn test_owned_layouts_full_nics_are_positional() {
        let segments = rank_slices(300, 4, 8).unwrap();
        let rings = rings_8p();
        let (layouts, split) = owned_layouts(&segments, &rings, &(0..8).collect::<Vec<_>>()).unwrap();
        assert!(split.is_some());
        let mut all = Vec::new();
        for (ring, layout) in rings.iter().zip(&layouts) {
            assert!(layout.owners.is_none());
            for (p, s) in layout.slices.iter().enumerate() {
                let seg = segments[ring.order[p] as usize];
                assert!(s.is_empty() || (s.offset >= seg.offset && s.end() <= seg.end()));
            }
            all.extend(layout.slices.iter().copied());
        }
        check_partition(&all, 8 * 1200).unwrap();
    }

    #[test]
    fn test_owned_layouts_nic_deficient() {
        let segments = rank_slices(64, 4, 8).unwrap();
        let rings = rings_8p();
        let (layouts, split) = owned_layouts(&segments, &rings, &[0, 2, 4, 6]).unwrap();
        let split = split.unwrap();
        assert_eq!(split.nic_send_sizes.len(), 4);
        let mut all = Vec::new();
        for (ring, layout) in rings.iter().zip(&layouts) {
            let owners = layout.owners.as_ref().expect("owners differ from positions");
            assert_eq!(owners.len(), layout.slices.len());
            for (s, &o) in layout.slices.iter().zip(owners) {
                let seg = segments[ring.order[o] as usize];
                assert!(s.is_empty() || (s.offset >= seg.offset && s.end() <= seg.end()));
            }
            all.extend(layout.slices.iter().copied());
        }
        check_partition(&all, 8 * 256).unwrap();
    }

    #[test]
    fn test_single_ring_layout_follows_order() {
        let segments = rank_slices(1, 4, 4).unwrap();
        let ring = RingPlane::new(CommLevel::Level0, 0, vec![0, 3, 2, 1]);
        let (layouts, split) = owned_layouts(&segments, std::slice::from_ref(&ring), &[0, 1, 2, 3]).unwrap();
        assert!(split.is_none());
        assert_eq!(layouts[0].owners, Some(vec![0, 3, 2, 1]));

        let pos = positional_layouts(&segments, std::slice::from_ref(&ring)).unwrap();
        assert_eq!(pos[0][1], segments[3]);
    }
}
