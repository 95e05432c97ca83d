use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use gridclaim_shared::{Cell, LiveEvent, RankingEntry, RawCell};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cell_store::CellStore;
use crate::chunks::{ChunkDirectory, ChunkKey, LoadState};
use crate::cluster::{Cluster, compute_clusters};
use crate::compositor::{FrameStats, Scene, Surface, composite};
use crate::config::EngineConfig;
use crate::debounce::Debouncer;
use crate::error::ClusterError;
use crate::fetch::{
    FetchOutcome, FetchScheduler, LoadingSink, RangeSource, SchedulerEvent, SchedulerLimits, settle,
};
use crate::raster::Palette;
use crate::render_loop::RenderScheduler;
use crate::selection::{HitTest, Selection, SelectionReport, SelectionSink, hit_test};
use crate::viewport::{MINIMAP_SIZE_PX, MinimapRect, Viewport};

/// Timer expirations posted back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ClusterDebounce(u64),
    /// A failed chunk's backoff elapsed; repaint so it is requested again.
    RetryDue,
}

/// Input and queries for a running engine. Screen coordinates are pixels.
#[derive(Debug)]
pub enum EngineCommand {
    Resize { width: u32, height: u32 },
    Pan { dx: f64, dy: f64 },
    Zoom { wheel_delta: f64, screen_x: f64, screen_y: f64 },
    Pinch { distance_delta: f64 },
    FitToScreen,
    BeginSelection { screen_x: f64, screen_y: f64 },
    UpdateSelection { screen_x: f64, screen_y: f64 },
    FinishSelection { screen_x: f64, screen_y: f64 },
    Tap { screen_x: f64, screen_y: f64 },
    ClearSelection,
    HitTest { screen_x: f64, screen_y: f64, reply: oneshot::Sender<HitTest> },
    TopGroups { n: usize, reply: oneshot::Sender<Vec<RankingEntry>> },
    Stats { reply: oneshot::Sender<EngineStats> },
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub cells: usize,
    pub distinct_owners: usize,
    pub distinct_groups: usize,
    pub loaded_chunks: usize,
    pub pending_chunks: usize,
    pub cached_rasters: usize,
    pub clusters: usize,
    pub frames: u64,
    pub malformed_dropped: u64,
    pub cluster_failed: bool,
}

/// What one batch of raw cells did to the store.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
    pub touched: BTreeSet<ChunkKey>,
}

/// Receivers the engine's owner loop drains alongside commands and live events.
pub struct EngineInbox {
    pub scheduler: mpsc::UnboundedReceiver<SchedulerEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
}

/// Single owner of the cell store, chunk directory, clusters, viewport and
/// selection. Every mutation happens on the task running [`Engine::run`].
pub struct Engine {
    config: EngineConfig,
    store: CellStore,
    directory: ChunkDirectory,
    palette: Palette,
    clusters: Vec<Cluster>,
    cluster_error: Option<ClusterError>,
    viewport: Viewport,
    canvas: (f64, f64),
    selection: Selection,
    /// Last pointer position of an active drag, for edge auto-pan.
    drag_pointer: Option<(f64, f64)>,
    render: RenderScheduler,
    scheduler: FetchScheduler,
    loading: Arc<dyn LoadingSink>,
    debounce: Debouncer<TimerEvent>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    selection_sink: Option<Arc<dyn SelectionSink>>,
    reconciled: bool,
    malformed_dropped: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn RangeSource>,
        loading: Arc<dyn LoadingSink>,
        canvas: (u32, u32),
    ) -> (Self, EngineInbox) {
        let (scheduler, scheduler_rx) = FetchScheduler::new(
            config.geometry,
            source,
            SchedulerLimits {
                max_concurrent: config.max_concurrent_fetches,
                timeout: config.fetch_timeout,
            },
        );
        let (timers, timers_rx) = mpsc::unbounded_channel();
        let debounce = Debouncer::new(
            config.cluster_debounce,
            timers.clone(),
            TimerEvent::ClusterDebounce,
        );
        let engine = Self {
            directory: ChunkDirectory::new(config.geometry),
            config,
            store: CellStore::new(),
            palette: Palette::new(),
            clusters: Vec::new(),
            cluster_error: None,
            viewport: Viewport::default(),
            canvas: (canvas.0 as f64, canvas.1 as f64),
            selection: Selection::new(),
            drag_pointer: None,
            render: RenderScheduler::new(),
            scheduler,
            loading,
            debounce,
            timers,
            selection_sink: None,
            reconciled: false,
            malformed_dropped: 0,
        };
        (
            engine,
            EngineInbox {
                scheduler: scheduler_rx,
                timers: timers_rx,
            },
        )
    }

    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = palette;
        self
    }

    pub fn with_selection_sink(mut self, sink: Arc<dyn SelectionSink>) -> Self {
        self.selection_sink = Some(sink);
        self
    }

    pub fn store(&self) -> &CellStore {
        &self.store
    }

    pub fn directory(&self) -> &ChunkDirectory {
        &self.directory
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The visible window on the overview map.
    pub fn minimap_rect(&self) -> MinimapRect {
        let (w, h) = self.canvas;
        self.viewport.minimap_rect(
            self.config.geometry.world_size as f64,
            w,
            h,
            MINIMAP_SIZE_PX,
        )
    }

    pub fn is_dirty(&self) -> bool {
        self.render.is_dirty()
    }

    pub fn top_groups(&self, n: usize) -> Vec<RankingEntry> {
        self.store.top_groups_by_count(n)
    }

    pub fn stats(&self) -> EngineStats {
        let counters = self.store.counters();
        EngineStats {
            cells: self.store.len(),
            distinct_owners: counters.distinct_owners(),
            distinct_groups: counters.distinct_groups(),
            loaded_chunks: self.directory.count_in_state(LoadState::Loaded),
            pending_chunks: self.directory.count_in_state(LoadState::Pending),
            cached_rasters: self.directory.cached_raster_count(),
            clusters: self.clusters.len(),
            frames: self.render.frames(),
            malformed_dropped: self.malformed_dropped,
            cluster_failed: self.cluster_error.is_some(),
        }
    }

    pub fn fit_to_screen(&mut self) {
        let (w, h) = self.canvas;
        self.viewport
            .fit_to_screen(self.config.geometry.world_size as f64, w, h);
        self.render.mark_dirty();
    }

    /// Queue fetches for every unresolved chunk under the current viewport.
    pub fn request_visible(&mut self) -> usize {
        let visible = self.viewport.visible_rect(self.canvas.0, self.canvas.1);
        self.scheduler
            .request_range(&mut self.directory, &visible, Instant::now())
    }

    /// Validate and upsert a batch, moving chunk membership with each
    /// replacement. Malformed records are dropped without affecting the rest.
    pub fn ingest(&mut self, raws: Vec<RawCell>) -> IngestReport {
        let mut report = IngestReport::default();
        for raw in raws {
            let cell = match Cell::from_raw(&self.config.geometry, raw) {
                Ok(cell) => cell,
                Err(e) => {
                    debug!(error = %e, "dropping malformed cell");
                    report.dropped += 1;
                    continue;
                }
            };
            let key = cell.key();
            let previous = self.store.upsert(cell);
            if let Some(current) = self.store.get(key.0, key.1) {
                report.touched.extend(
                    self.directory
                        .transfer_membership(current, previous.as_ref()),
                );
            }
            report.accepted += 1;
        }
        if report.dropped > 0 {
            self.malformed_dropped += report.dropped as u64;
            warn!(
                dropped = report.dropped,
                accepted = report.accepted,
                "malformed cells dropped from batch"
            );
        }
        report
    }

    fn invalidate_all(&mut self, keys: impl IntoIterator<Item = ChunkKey>) {
        for key in keys {
            if let Err(e) = self.directory.invalidate(key, &self.store, &self.palette) {
                error!(cx = key.cx, cy = key.cy, error = %e, "chunk rasterization failed");
            }
        }
    }

    pub fn apply_scheduler_event(&mut self, event: SchedulerEvent) {
        event.notify(self.loading.as_ref());
        match event {
            SchedulerEvent::Busy => {}
            SchedulerEvent::Completed(outcome) => self.apply_fetch(outcome),
            SchedulerEvent::Idle => self.on_idle(),
        }
    }

    pub fn apply_fetch(&mut self, outcome: FetchOutcome) {
        let now = Instant::now();
        settle(
            &mut self.directory,
            &outcome,
            now,
            self.config.fetch_retry_base,
            self.config.fetch_retry_max,
        );
        let key = outcome.key;
        match outcome.result {
            Ok(raws) => {
                let mut report = self.ingest(raws);
                report.touched.insert(key);
                debug!(
                    cx = key.cx,
                    cy = key.cy,
                    cells = report.accepted,
                    "chunk loaded"
                );
                let changed = report.accepted > 0;
                self.invalidate_all(report.touched);
                if changed {
                    self.debounce.request();
                }
                self.render.mark_dirty();
            }
            Err(_) => self.schedule_retry_wake(key),
        }
    }

    fn schedule_retry_wake(&self, key: ChunkKey) {
        let Some(chunk) = self.directory.get(key) else {
            return;
        };
        let delay = crate::chunks::retry_backoff(
            chunk.failures(),
            self.config.fetch_retry_base,
            self.config.fetch_retry_max,
        );
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(TimerEvent::RetryDue);
        });
    }

    fn on_idle(&mut self) {
        if self.reconciled {
            debug!("chunk loading idle");
            return;
        }
        self.reconciled = true;
        let drifted = self.store.reconcile_counters();
        if drifted {
            warn!("aggregate counters drifted from the cell store; rebuilt");
        }
        info!(
            cells = self.store.len(),
            owners = self.store.counters().distinct_owners(),
            groups = self.store.counters().distinct_groups(),
            "initial load complete"
        );
        self.recompute_now();
    }

    /// Route a live update through the same upsert path as fetched cells.
    pub fn apply_live(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Cell { cell, .. } => {
                let report = self.ingest(vec![cell]);
                if report.accepted > 0 {
                    self.invalidate_all(report.touched);
                    self.debounce.request();
                    self.render.mark_dirty();
                }
            }
            LiveEvent::Cells { cells, .. } => {
                let report = self.ingest(cells);
                if report.accepted > 0 {
                    self.invalidate_all(report.touched);
                    self.recompute_now();
                    self.debounce.request();
                    self.render.mark_dirty();
                }
            }
            LiveEvent::Resync { .. } => {
                let keys = self.directory.unload_all();
                info!(chunks = keys.len(), "live stream resync, refetching loaded chunks");
                self.invalidate_all(keys);
                self.render.mark_dirty();
            }
        }
    }

    pub fn apply_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ClusterDebounce(generation) => {
                if self.debounce.accept(generation) {
                    self.recompute_now();
                }
            }
            TimerEvent::RetryDue => self.render.mark_dirty(),
        }
    }

    /// Rebuild clusters from the current store. On failure the previous
    /// clusters are kept and the error returned.
    pub fn recompute_clusters(&mut self) -> Result<usize, ClusterError> {
        match compute_clusters(&self.store, &self.config.geometry) {
            Ok(clusters) => {
                self.clusters = clusters;
                self.cluster_error = None;
                self.render.mark_dirty();
                Ok(self.clusters.len())
            }
            Err(e) => {
                self.cluster_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn recompute_now(&mut self) {
        match self.recompute_clusters() {
            Ok(count) => debug!(clusters = count, "clusters recomputed"),
            Err(e) => error!(error = %e, "cluster recomputation failed"),
        }
    }

    fn screen_to_world(&self, screen_x: f64, screen_y: f64) -> (f64, f64) {
        self.viewport.screen_to_world(screen_x, screen_y)
    }

    fn publish_selection(&self) {
        if let Some(sink) = &self.selection_sink {
            let report = SelectionReport::resolve(&self.store, self.selection.selected().to_vec());
            sink.selection_changed(&report);
        }
    }

    pub fn handle_command(&mut self, command: EngineCommand) -> ControlFlow<()> {
        let geometry = self.config.geometry;
        match command {
            EngineCommand::Resize { width, height } => {
                self.canvas = (width as f64, height as f64);
                self.render.mark_dirty();
            }
            EngineCommand::Pan { dx, dy } => {
                self.viewport.pan(dx, dy);
                self.render.mark_dirty();
            }
            EngineCommand::Zoom {
                wheel_delta,
                screen_x,
                screen_y,
            } => {
                self.viewport.zoom_at(wheel_delta, screen_x, screen_y);
                self.render.mark_dirty();
            }
            EngineCommand::Pinch { distance_delta } => {
                self.viewport
                    .pinch(distance_delta, self.canvas.0, self.canvas.1);
                self.render.mark_dirty();
            }
            EngineCommand::FitToScreen => self.fit_to_screen(),
            EngineCommand::BeginSelection { screen_x, screen_y } => {
                let (wx, wy) = self.screen_to_world(screen_x, screen_y);
                self.selection.begin_drag(&geometry, wx, wy);
                self.drag_pointer = Some((screen_x, screen_y));
                self.render.mark_dirty();
            }
            EngineCommand::UpdateSelection { screen_x, screen_y } => {
                let (wx, wy) = self.screen_to_world(screen_x, screen_y);
                self.selection.update_drag(&geometry, wx, wy);
                if self.selection.is_dragging() {
                    self.drag_pointer = Some((screen_x, screen_y));
                }
                self.render.mark_dirty();
            }
            EngineCommand::FinishSelection { screen_x, screen_y } => {
                self.drag_pointer = None;
                let (wx, wy) = self.screen_to_world(screen_x, screen_y);
                if self.selection.finish_drag(&geometry, wx, wy).is_some() {
                    self.publish_selection();
                }
                self.render.mark_dirty();
            }
            EngineCommand::Tap { screen_x, screen_y } => {
                self.drag_pointer = None;
                let (wx, wy) = self.screen_to_world(screen_x, screen_y);
                self.selection.tap(&geometry, &self.store, wx, wy);
                self.publish_selection();
                self.render.mark_dirty();
            }
            EngineCommand::ClearSelection => {
                self.drag_pointer = None;
                self.selection.clear();
                self.publish_selection();
                self.render.mark_dirty();
            }
            EngineCommand::HitTest {
                screen_x,
                screen_y,
                reply,
            } => {
                let (wx, wy) = self.screen_to_world(screen_x, screen_y);
                let _ = reply.send(hit_test(&geometry, &self.store, wx, wy));
            }
            EngineCommand::TopGroups { n, reply } => {
                let _ = reply.send(self.top_groups(n));
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            EngineCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// While a drag holds the pointer near a canvas edge, pan one step and
    /// move the drag end to the world point now under the pointer.
    fn auto_pan(&mut self) {
        let Some((px, py)) = self.drag_pointer else {
            return;
        };
        if !self.selection.is_dragging() {
            self.drag_pointer = None;
            return;
        }
        let (w, h) = self.canvas;
        if self.viewport.edge_pan(px, py, w, h) {
            let (wx, wy) = self.screen_to_world(px, py);
            self.selection.update_drag(&self.config.geometry, wx, wy);
            self.render.mark_dirty();
        }
    }

    /// One animation tick: when dirty, request the visible chunks and
    /// composite. Returns `None` when nothing changed since the last frame.
    pub fn frame(&mut self, surface: &mut dyn Surface) -> Option<FrameStats> {
        self.auto_pan();
        if !self.render.begin_frame() {
            return None;
        }
        let (w, h) = self.canvas;
        let visible = self.viewport.visible_rect(w, h);
        self.scheduler
            .request_range(&mut self.directory, &visible, Instant::now());

        let geometry = self.config.geometry;
        let scene = Scene {
            geometry: &geometry,
            viewport: &self.viewport,
            visible,
            rasters: self.directory.rasters_in(&visible),
            clusters: &self.clusters,
            drag_rect: self.selection.drag_rect(&geometry),
            selection_bounds: self.selection.selection_bounds(&geometry),
        };
        let stats = composite(surface, &scene);
        self.render.end_frame(false);
        Some(stats)
    }

    /// Owner loop. Returns the surface once shut down or once every command
    /// sender is gone.
    pub async fn run<S: Surface + Send>(
        mut self,
        mut inbox: EngineInbox,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut live: mpsc::Receiver<LiveEvent>,
        mut surface: S,
        frame_interval: Duration,
    ) -> S {
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = inbox.scheduler.recv() => self.apply_scheduler_event(event),
                Some(event) = inbox.timers.recv() => self.apply_timer(event),
                Some(event) = live.recv() => self.apply_live(event),
                _ = ticker.tick() => {
                    self.frame(&mut surface);
                }
            }
        }
        self.debounce.cancel();
        info!(cells = self.store.len(), "engine stopped");
        surface
    }
}

/// Channels into a spawned engine.
pub struct EngineHandle<S> {
    commands: mpsc::Sender<EngineCommand>,
    live: mpsc::Sender<LiveEvent>,
    task: JoinHandle<S>,
}

const COMMAND_BUFFER: usize = 256;

impl<S: Surface + Send + 'static> EngineHandle<S> {
    pub fn spawn(engine: Engine, inbox: EngineInbox, surface: S, frame_interval: Duration) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (live, live_rx) = mpsc::channel(engine.config.live_event_buffer.max(1));
        let task = tokio::spawn(engine.run(inbox, commands_rx, live_rx, surface, frame_interval));
        Self {
            commands,
            live,
            task,
        }
    }

    /// Bounded sender for live updates.
    pub fn live_sender(&self) -> mpsc::Sender<LiveEvent> {
        self.live.clone()
    }

    pub async fn send(&self, command: EngineCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn top_groups(&self, n: usize) -> Option<Vec<RankingEntry>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::TopGroups { n, reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn stats(&self) -> Option<EngineStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::Stats { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn hit_test(&self, screen_x: f64, screen_y: f64) -> Option<HitTest> {
        let (reply, rx) = oneshot::channel();
        let command = EngineCommand::HitTest {
            screen_x,
            screen_y,
            reply,
        };
        if !self.send(command).await {
            return None;
        }
        rx.await.ok()
    }

    /// Stop the owner loop and take back the surface.
    pub async fn shutdown(self) -> Result<S, tokio::task::JoinError> {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
        self.task.await
    }
}
