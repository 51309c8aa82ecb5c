//! The data set: one opened trace, its build products and the query entry points.
//!
//! [`DataSet::build`] makes the single full pass over the merged event stream,
//! producing the final state and the timestamp index. Every later query
//! restarts from the nearest index checkpoint and replays forward.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::cancel::{CancelToken, Phase, Progress, ProgressSink};
use crate::config::BuildConfig;
use crate::format::{SegmentTable, SnapshotIndexEntry, TraceFile};
use crate::history::{self, ResourceHistory};
use crate::jobs::JobPool;
use crate::parser::{open_heap, SeekIndex, SeekIndexBuilder, TokenHeap};
use crate::snapshot::{
    aliasing, derive, AliasingTimeline, ResourceResolution, Snapshot, TimelineBucket,
};
use crate::state::{Applied, ApplyContext, BuildStats, LiveState, Resource, ResourceIdx};
use crate::types::{SegmentKind, Timestamp};
use crate::{Error, Result};

/// A named timestamp worth snapshotting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotPoint {
    pub name: String,
    pub timestamp: Timestamp,
}

struct Built {
    state: Arc<LiveState>,
    index: SeekIndex,
    /// Resources compacted out of the live pools during the build.
    retired: Vec<(ResourceIdx, Arc<Resource>)>,
    first_timestamp: Timestamp,
    last_timestamp: Timestamp,
}

pub struct DataSet {
    trace: TraceFile,
    config: BuildConfig,
    segments: Arc<SegmentTable>,
    pool: JobPool,
    built: Option<Built>,
    snapshot_points: Vec<SnapshotPoint>,
}

impl DataSet {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, BuildConfig::default())
    }

    pub fn open_with_config(path: &Path, config: BuildConfig) -> Result<Self> {
        Self::from_trace(TraceFile::open(path)?, config)
    }

    pub fn from_trace(trace: TraceFile, config: BuildConfig) -> Result<Self> {
        config.validate()?;
        let pool = JobPool::new(config.effective_workers())?;
        let snapshot_points = trace
            .snapshot_index
            .iter()
            .map(|entry| SnapshotPoint {
                name: entry.name.clone(),
                timestamp: entry.timestamp,
            })
            .collect();
        Ok(Self {
            segments: Arc::new(trace.segments.clone()),
            trace,
            config,
            pool,
            built: None,
            snapshot_points,
        })
    }

    pub fn trace(&self) -> &TraceFile {
        &self.trace
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    fn built(&self) -> Result<&Built> {
        self.built.as_ref().ok_or(Error::NotBuilt)
    }

    /// State after the last event of the trace.
    pub fn final_state(&self) -> Result<&LiveState> {
        Ok(&self.built()?.state)
    }

    pub fn index(&self) -> Result<&SeekIndex> {
        Ok(&self.built()?.index)
    }

    pub fn stats(&self) -> Result<BuildStats> {
        Ok(self.built()?.state.stats)
    }

    /// Timestamps of the first and last events.
    pub fn time_range(&self) -> Result<(Timestamp, Timestamp)> {
        let built = self.built()?;
        Ok((built.first_timestamp, built.last_timestamp))
    }

    fn context(&self) -> ApplyContext<'_> {
        ApplyContext {
            segments: &self.segments,
            policy: self.config.duplicate_resources,
        }
    }

    /// Full pass over the trace. On failure or cancellation nothing from the
    /// attempt is kept and the data set stays unbuilt.
    pub fn build(&mut self, progress: &mut dyn ProgressSink, cancel: &CancelToken) -> Result<()> {
        self.built = None;
        let built = self.run_build(progress, cancel)?;
        self.built = Some(built);
        Ok(())
    }

    fn run_build(&mut self, progress: &mut dyn ProgressSink, cancel: &CancelToken) -> Result<Built> {
        let ctx = self.context();
        let mut heap = open_heap(&self.trace, cancel.clone())?;
        let total = heap.bytes_total();
        let interval = u64::from(self.config.progress_interval.max(1));
        let report = |progress: &mut dyn ProgressSink, consumed: u64, phase: Phase| {
            let keep_going = progress.report(Progress {
                bytes_consumed: consumed,
                bytes_total: total,
                phase,
            });
            if !keep_going {
                cancel.cancel();
            }
            cancel.check()
        };
        report(progress, 0, Phase::Parse)?;

        let mut state = LiveState::new();
        let mut index = SeekIndexBuilder::new(
            u64::from(self.config.index_stride),
            u64::from(self.config.checkpoint_interval),
        );
        let mut first_timestamp = None;
        let mut markers = Vec::new();
        let mut retired = Vec::new();
        loop {
            // Later checkpoints and the final state start from here, so
            // records destroyed before now are only needed for history.
            if index.checkpoint_due(state.ordinal) {
                state.compact(state.timestamp, &mut retired)?;
            }
            index.observe(&heap, &state)?;
            let Some(event) = heap.next()? else {
                break;
            };
            first_timestamp.get_or_insert(event.timestamp);
            if let Applied::SnapshotMarker(name) = state.apply(&event, &ctx)? {
                markers.push(SnapshotPoint {
                    name: name.to_string(),
                    timestamp: event.timestamp,
                });
            }
            if state.ordinal % interval == 0 {
                report(progress, heap.bytes_consumed(), Phase::Build)?;
            }
        }
        report(progress, total, Phase::Build)?;

        let index = index.finish();
        info!(
            "built {} events ({} orphan, {} compacted, {} index entries, {} checkpoints)",
            state.stats.events,
            state.stats.orphan_events,
            state.stats.compacted_records,
            index.len(),
            index.checkpoint_count()
        );
        let unresolved = (
            state.user_data.pending_name_count(),
            state.user_data.correlation_count(),
        );
        if unresolved != (0, 0) {
            debug!(
                "{} debug names and {} correlations never reached a resource",
                unresolved.0, unresolved.1
            );
        }
        for marker in markers {
            if !self.snapshot_points.contains(&marker) {
                self.snapshot_points.push(marker);
            }
        }
        Ok(Built {
            first_timestamp: first_timestamp.unwrap_or(0),
            last_timestamp: state.timestamp,
            state: Arc::new(state),
            index,
            retired,
        })
    }

    /// Fresh heap and state positioned at the latest checkpoint not after `at`.
    fn restart(
        &self,
        built: &Built,
        at: Timestamp,
        cancel: &CancelToken,
    ) -> Result<(LiveState, TokenHeap<'_>)> {
        let mut heap = open_heap(&self.trace, cancel.clone())?;
        let checkpoint = built
            .index
            .checkpoint_at_or_before(at)
            .and_then(|entry| entry.checkpoint.as_ref().map(|state| (entry, state)));
        let state = match checkpoint {
            Some((entry, state)) => {
                heap.seek(&entry.cursor)?;
                debug!("replay from checkpoint at ordinal {}", entry.ordinal);
                LiveState::clone(state)
            }
            None => LiveState::new(),
        };
        Ok((state, heap))
    }

    /// State after every event with timestamp `<= timestamp`.
    pub fn state_at(&self, timestamp: Timestamp, cancel: &CancelToken) -> Result<LiveState> {
        let built = self.built()?;
        let ctx = self.context();
        let (mut state, mut heap) = self.restart(built, timestamp, cancel)?;
        while heap.peek_timestamp().is_some_and(|next| next <= timestamp) {
            let Some(event) = heap.next()? else {
                break;
            };
            state.apply(&event, &ctx)?;
        }
        Ok(state)
    }

    pub fn snapshot(&self, timestamp: Timestamp) -> Result<Snapshot> {
        self.snapshot_named("", timestamp, &CancelToken::new())
    }

    pub fn snapshot_named(
        &self,
        name: &str,
        timestamp: Timestamp,
        cancel: &CancelToken,
    ) -> Result<Snapshot> {
        let state = self.state_at(timestamp, cancel)?;
        Snapshot::freeze(
            name,
            timestamp,
            state,
            Arc::clone(&self.segments),
            &self.pool,
            cancel,
        )
    }

    pub fn snapshot_points(&self) -> &[SnapshotPoint] {
        &self.snapshot_points
    }

    pub fn add_snapshot_point(&mut self, name: &str, timestamp: Timestamp) -> usize {
        self.snapshot_points.push(SnapshotPoint {
            name: name.to_owned(),
            timestamp,
        });
        self.snapshot_points.len() - 1
    }

    /// Returns false when `index` names no point.
    pub fn rename_snapshot_point(&mut self, index: usize, name: &str) -> bool {
        match self.snapshot_points.get_mut(index) {
            Some(point) => {
                point.name = name.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn remove_snapshot_point(&mut self, index: usize) -> Option<SnapshotPoint> {
        (index < self.snapshot_points.len()).then(|| self.snapshot_points.remove(index))
    }

    pub fn snapshot_at_point(&self, index: usize) -> Result<Option<Snapshot>> {
        let Some(point) = self.snapshot_points.get(index) else {
            return Ok(None);
        };
        self.snapshot_named(&point.name, point.timestamp, &CancelToken::new())
            .map(Some)
    }

    /// Snapshot points in the form stored by the `SnapshotIndex` chunk.
    pub fn snapshot_index(&self) -> Vec<SnapshotIndexEntry> {
        self.snapshot_points
            .iter()
            .map(|point| SnapshotIndexEntry {
                timestamp: point.timestamp,
                name: point.name.clone(),
            })
            .collect()
    }

    /// Events touching resource `id` within `range`, or within its lifetime
    /// when no range is given.
    pub fn resource_history(
        &self,
        id: u64,
        range: Option<RangeInclusive<Timestamp>>,
    ) -> Result<ResourceHistory> {
        let built = self.built()?;
        let records: Vec<(ResourceIdx, &Resource)> = built
            .retired
            .iter()
            .map(|(idx, resource)| (*idx, resource.as_ref()))
            .chain(built.state.resources.iter())
            .filter(|(_, resource)| resource.identifiers.contains(&id))
            .collect();
        if records.is_empty() {
            return Err(Error::UnknownResource(id));
        }
        let range = range.unwrap_or_else(|| {
            let created = records
                .iter()
                .map(|(_, r)| r.created)
                .min()
                .unwrap_or(0);
            let destroyed = records
                .iter()
                .map(|(_, r)| r.destroyed.unwrap_or(Timestamp::MAX))
                .max()
                .unwrap_or(Timestamp::MAX);
            created..=destroyed
        });
        let targets: BTreeSet<_> = records.into_iter().map(|(idx, _)| idx).collect();
        let cancel = CancelToken::new();
        let (mut state, mut heap) = match range.start().checked_sub(1) {
            Some(before) => self.restart(built, before, &cancel)?,
            None => (LiveState::new(), open_heap(&self.trace, cancel)?),
        };
        history::collect(&mut heap, &mut state, &self.context(), id, &targets, range)
    }

    /// Aliasing measured at the end of `buckets` equal slices of the trace.
    ///
    /// Boundary states are reached by one sequential replay. A boundary whose
    /// alias epoch matches the previous one reuses its measurement.
    pub fn aliasing_timeline(&self, buckets: usize, cancel: &CancelToken) -> Result<AliasingTimeline> {
        let built = self.built()?;
        if buckets == 0 || built.state.stats.events == 0 {
            return Ok(AliasingTimeline::default());
        }
        let ctx = self.context();
        let start = built.first_timestamp;
        let span = built.last_timestamp - start;
        let mut heap = open_heap(&self.trace, cancel.clone())?;
        let mut state = LiveState::new();

        let mut states: Vec<Arc<LiveState>> = Vec::new();
        let mut slots = Vec::with_capacity(buckets);
        let mut last_epoch = None;
        let mut bounds = Vec::with_capacity(buckets);
        let mut previous_end = start;
        for bucket in 0..buckets {
            let end = start + (u128::from(span) * (bucket as u128 + 1) / buckets as u128) as u64;
            while heap.peek_timestamp().is_some_and(|next| next <= end) {
                let Some(event) = heap.next()? else {
                    break;
                };
                state.apply(&event, &ctx)?;
            }
            if last_epoch != Some(state.alias_epoch) {
                states.try_reserve(1)?;
                states.push(Arc::new(state.clone()));
                last_epoch = Some(state.alias_epoch);
            }
            slots.push(states.len() - 1);
            bounds.push((previous_end, end, state.resources.live_count()));
            previous_end = end;
        }
        debug!("aliasing timeline: {buckets} buckets, {} distinct states", states.len());

        let segments = Arc::clone(&self.segments);
        let measured = self.pool.map(
            states,
            move |state| measure(&state, &segments),
            cancel,
        )?;
        let buckets = bounds
            .into_iter()
            .zip(slots)
            .map(|((start, end, live_resources), slot)| {
                let m = &measured[slot];
                TimelineBucket {
                    start,
                    end,
                    aliased_components: m.aliased_components,
                    aliased_resources: m.aliased_resources,
                    aliased_bytes: m.aliased_bytes,
                    live_resources,
                    committed_by_kind: m.committed_by_kind,
                }
            })
            .collect();
        Ok(AliasingTimeline { buckets })
    }
}

struct Measure {
    aliased_components: usize,
    aliased_resources: usize,
    aliased_bytes: u64,
    committed_by_kind: [u64; SegmentKind::COUNT],
}

fn measure(state: &LiveState, segments: &SegmentTable) -> Measure {
    let live = state.resources.live_indices();
    let resolutions = derive::resolve_resources(state, &live);
    let footprints: Vec<_> = resolutions
        .iter()
        .flat_map(ResourceResolution::footprints)
        .collect();
    let partition = aliasing::partition_serial(&footprints, |idx| {
        state.resources.get(idx).map_or(0, |r| r.id)
    });
    let mut committed_by_kind = [0u64; SegmentKind::COUNT];
    let committed = state.page_table.mapped_bytes_per_segment();
    for (segment, info) in segments.iter() {
        committed_by_kind[info.kind.as_u8() as usize] += committed[segment.index()];
    }
    Measure {
        aliased_components: partition.aliased_components().count(),
        aliased_resources: partition.aliased_resource_count(),
        aliased_bytes: partition.aliased_bytes,
        committed_by_kind,
    }
}
