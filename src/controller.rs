use crate::{
    BlockQueue, BoardDriver, ChannelCatalog, DaqError, DaqResult, FilterEngine, PreTriggerBuffer,
    RecordingSerializer, SampleBlock, SaveFormat, SaveLists, SessionHeader, TriggerSettings,
    MAX_BLOCKS, SAMPLES_PER_BLOCK,
};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

/// FIFO fill level above which a poll counts as a strike.
pub const FIFO_FULL_PERCENT: f64 = 98.0;
/// Consecutive strikes that halt acquisition.
pub const FIFO_STRIKE_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Running,
    ArmedForTrigger,
    Recording,
    /// Episodic recording; counts drains without an active trigger sample.
    RecordingAfterTrigger { quiet_cycles: usize },
}

impl AcquisitionState {
    pub fn is_recording(self) -> bool {
        matches!(
            self,
            AcquisitionState::Recording | AcquisitionState::RecordingAfterTrigger { .. }
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            AcquisitionState::Idle => "Idle",
            AcquisitionState::Running => "Running",
            AcquisitionState::ArmedForTrigger => "Armed",
            AcquisitionState::Recording => "Recording",
            AcquisitionState::RecordingAfterTrigger { .. } => "Recording (triggered)",
        }
    }
}

/// Counts consecutive FIFO polls above [`FIFO_FULL_PERCENT`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoGuard {
    strikes: usize,
}

impl FifoGuard {
    /// Record one poll; returns true once the strike limit is reached.
    pub fn poll(&mut self, percent: f64) -> bool {
        if percent > FIFO_FULL_PERCENT {
            self.strikes += 1;
            warn!(
                "FIFO {percent:.1}% full ({} of {FIFO_STRIKE_LIMIT})",
                self.strikes
            );
        } else {
            self.strikes = 0;
        }
        self.strikes >= FIFO_STRIKE_LIMIT
    }

    pub fn strikes(&self) -> usize {
        self.strikes
    }

    pub fn reset(&mut self) {
        self.strikes = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Opened(PathBuf),
    Rotated(PathBuf),
    Closed(PathBuf),
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub blocks: usize,
    pub bytes_written: usize,
    pub fifo_percent: f64,
    pub latency_ms: f64,
    pub state: AcquisitionState,
    pub events: Vec<FileEvent>,
}

/// Drives the board and routes every drained block to the filter and, while
/// recording, to disk.
pub struct AcquisitionController<B: BoardDriver> {
    board: B,
    queue: BlockQueue,
    filter: FilterEngine,
    serializer: RecordingSerializer,
    header: SessionHeader,
    blocks_per_drain: usize,
    rotation_minutes: f64,
    state: AcquisitionState,
    trigger: Option<TriggerSettings>,
    pre_trigger: PreTriggerBuffer,
    fifo: FifoGuard,
    /// Recorded duration of the current file.
    file_seconds: f64,
    events: Vec<FileEvent>,
}

impl<B: BoardDriver> AcquisitionController<B> {
    pub fn new(
        board: B,
        serializer: RecordingSerializer,
        mut header: SessionHeader,
        blocks_per_drain: usize,
        rotation_minutes: f64,
    ) -> DaqResult<Self> {
        if blocks_per_drain == 0 || blocks_per_drain > MAX_BLOCKS {
            return Err(DaqError::InvalidSettings(format!(
                "{blocks_per_drain} blocks per drain; 1-{MAX_BLOCKS} supported"
            )));
        }
        if rotation_minutes.is_nan() || rotation_minutes <= 0.0 {
            return Err(DaqError::InvalidSettings(format!(
                "rotation period of {rotation_minutes} minutes"
            )));
        }
        header.sample_rate = board.sample_rate();
        let filter = FilterEngine::new(board.num_streams(), MAX_BLOCKS, board.sample_rate());
        Ok(Self {
            board,
            queue: BlockQueue::new(),
            filter,
            serializer,
            header,
            blocks_per_drain,
            rotation_minutes,
            state: AcquisitionState::Idle,
            trigger: None,
            pre_trigger: PreTriggerBuffer::default(),
            fifo: FifoGuard::default(),
            file_seconds: 0.0,
            events: Vec::new(),
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut FilterEngine {
        &mut self.filter
    }

    pub fn serializer(&self) -> &RecordingSerializer {
        &self.serializer
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut SessionHeader {
        &mut self.header
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.header.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut ChannelCatalog {
        &mut self.header.catalog
    }

    pub fn trigger(&self) -> Option<&TriggerSettings> {
        self.trigger.as_ref()
    }

    pub fn pre_trigger_len(&self) -> usize {
        self.pre_trigger.len()
    }

    pub fn blocks_per_drain(&self) -> usize {
        self.blocks_per_drain
    }

    pub fn recording_location(&self) -> Option<&Path> {
        self.serializer.location()
    }

    /// Begin continuous acquisition from `Idle`.
    pub fn start(&mut self) -> DaqResult<()> {
        if self.state != AcquisitionState::Idle {
            return Err(DaqError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        let streams = self.board.num_streams();
        let sample_rate = self.board.sample_rate();
        self.filter.reset(streams, sample_rate);
        self.filter
            .reset_temperature_history(3 * self.blocks_per_drain);
        self.queue.clear();
        self.fifo.reset();
        self.board.flush();
        self.board.start_continuous()?;
        self.state = AcquisitionState::Running;
        info!("Acquisition running: {streams} streams at {sample_rate} S/s");
        Ok(())
    }

    fn ensure_running(&mut self, action: &'static str) -> DaqResult<()> {
        match self.state {
            AcquisitionState::Idle => self.start(),
            AcquisitionState::Running => Ok(()),
            state => Err(DaqError::InvalidState { action, state }),
        }
    }

    /// Record every block from now on.
    pub fn start_recording(&mut self) -> DaqResult<()> {
        self.ensure_running("start recording")?;
        let lists = self
            .header
            .catalog
            .save_lists(None, self.serializer.save_ttl_out());
        self.open_session(lists, 0)?;
        self.state = AcquisitionState::Recording;
        Ok(())
    }

    /// Buffer blocks until the trigger fires, then record episodes.
    pub fn arm_trigger(&mut self, settings: TriggerSettings) -> DaqResult<()> {
        settings.validate()?;
        self.ensure_running("arm trigger")?;
        let capacity =
            settings.pre_trigger_capacity(self.blocks_per_drain, self.board.sample_rate());
        self.pre_trigger = PreTriggerBuffer::new(capacity);
        self.trigger = Some(settings);
        self.state = AcquisitionState::ArmedForTrigger;
        info!(
            "Trigger armed on channel {} ({:?}), keeping {capacity} blocks",
            settings.channel(),
            settings.polarity
        );
        Ok(())
    }

    /// Close any open file and keep acquiring.
    pub fn stop_recording(&mut self) -> DaqResult<()> {
        match self.state {
            AcquisitionState::Idle | AcquisitionState::Running => Ok(()),
            _ => {
                self.trigger = None;
                self.pre_trigger.clear();
                self.state = AcquisitionState::Running;
                self.close_session()
            }
        }
    }

    /// Close any open file, halt the board and discard its FIFO.
    pub fn stop(&mut self) -> DaqResult<()> {
        let closed = self.close_session();
        self.trigger = None;
        self.pre_trigger.clear();
        self.board.stop();
        self.board.flush();
        self.queue.clear();
        self.state = AcquisitionState::Idle;
        info!("Acquisition stopped");
        closed
    }

    pub fn fifo_percent(&self) -> f64 {
        let capacity = self.board.fifo_capacity_words();
        if capacity == 0 {
            return 0.0;
        }
        100.0 * self.board.fifo_occupancy_words() as f64 / capacity as f64
    }

    /// Time the data waiting in the FIFO represents, in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        let words_per_block = SampleBlock::words_per_block(self.board.num_streams()) as f64;
        let blocks = self.board.fifo_occupancy_words() as f64 / words_per_block;
        1000.0 * SAMPLES_PER_BLOCK as f64 * blocks / self.board.sample_rate()
    }

    /// Drain one batch of blocks if the board has it ready.
    ///
    /// A FIFO overflow stops acquisition and returns `FifoOverflow`. A write
    /// failure ends the recording, leaves the board running and returns the error.
    pub fn drain_cycle(&mut self) -> DaqResult<DrainReport> {
        if self.state == AcquisitionState::Idle {
            return Err(DaqError::InvalidState {
                action: "drain",
                state: self.state,
            });
        }
        let count = self.blocks_per_drain;
        if !self.board.read_blocks(count, &mut self.queue)? {
            return Ok(self.report(0, 0, self.fifo_percent()));
        }
        let blocks = self.queue.take(count);
        self.filter.load(&blocks)?;

        let bytes = match self.dispatch(blocks) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abort_recording(&e);
                return Err(e);
            }
        };

        let percent = self.fifo_percent();
        if self.fifo.poll(percent) {
            let polls = self.fifo.strikes();
            error!("FIFO overflow imminent ({percent:.1}% for {polls} polls); halting");
            if let Err(e) = self.stop() {
                error!("Closing recording after overflow failed: {e}");
            }
            return Err(DaqError::FifoOverflow { percent, polls });
        }
        Ok(self.report(count, bytes, percent))
    }

    fn report(&mut self, blocks: usize, bytes_written: usize, fifo_percent: f64) -> DrainReport {
        DrainReport {
            blocks,
            bytes_written,
            fifo_percent,
            latency_ms: self.latency_ms(),
            state: self.state,
            events: std::mem::take(&mut self.events),
        }
    }

    fn dispatch(&mut self, blocks: Vec<SampleBlock>) -> DaqResult<usize> {
        let block_seconds = SAMPLES_PER_BLOCK as f64 / self.board.sample_rate();
        let mut bytes = 0;
        let mut quiet = true;

        for (i, block) in blocks.into_iter().enumerate() {
            let temperatures = self.filter.block_temperatures(i);
            match (self.state, self.trigger) {
                (AcquisitionState::Recording, _) => {
                    bytes += self.serializer.write_block(&block, &temperatures)?;
                    self.file_seconds += block_seconds;
                }
                (AcquisitionState::RecordingAfterTrigger { .. }, trigger) => {
                    if trigger.is_some_and(|t| t.find_trigger(&block).is_some()) {
                        quiet = false;
                    }
                    bytes += self.serializer.write_block(&block, &temperatures)?;
                    self.file_seconds += block_seconds;
                }
                (AcquisitionState::ArmedForTrigger, Some(trigger)) => {
                    match trigger.find_trigger(&block) {
                        Some(t) => {
                            quiet = false;
                            bytes += self.fire_trigger(&trigger, t, block, temperatures)?;
                        }
                        None => self.pre_trigger.push(block, temperatures),
                    }
                }
                _ => {}
            }
        }

        if let (AcquisitionState::RecordingAfterTrigger { quiet_cycles }, Some(trigger)) =
            (self.state, self.trigger)
        {
            let quiet_cycles = if quiet { quiet_cycles + 1 } else { 0 };
            let limit =
                trigger.post_trigger_drains(self.blocks_per_drain, self.board.sample_rate());
            if quiet_cycles > limit {
                info!("Episode ended after {quiet_cycles} quiet drains; re-arming");
                self.close_session()?;
                self.pre_trigger.clear();
                self.state = AcquisitionState::ArmedForTrigger;
            } else {
                self.state = AcquisitionState::RecordingAfterTrigger { quiet_cycles };
            }
        }

        if self.state.is_recording()
            && self.serializer.format() == SaveFormat::Intan
            && self.file_seconds >= 60.0 * self.rotation_minutes
        {
            let path = self.serializer.rotate()?;
            self.file_seconds = 0.0;
            self.events.push(FileEvent::Rotated(path));
        }
        Ok(bytes)
    }

    /// Open an episode file holding the buffered history followed by `block`.
    fn fire_trigger(
        &mut self,
        trigger: &TriggerSettings,
        t: usize,
        block: SampleBlock,
        temperatures: Vec<f64>,
    ) -> DaqResult<usize> {
        let offset = block.timestamp[t];
        info!("Trigger on channel {} at timestamp {offset}", trigger.channel());
        let forced = trigger.save_trigger_channel.then_some(trigger.source);
        let lists = self
            .header
            .catalog
            .save_lists(forced, self.serializer.save_ttl_out());
        self.open_session(lists, offset)?;

        let block_seconds = SAMPLES_PER_BLOCK as f64 / self.board.sample_rate();
        let mut bytes = 0;
        let mut written = 0;
        for (buffered, buffered_temperatures) in self.pre_trigger.drain() {
            bytes += self.serializer.write_block(&buffered, &buffered_temperatures)?;
            written += 1;
        }
        bytes += self.serializer.write_block(&block, &temperatures)?;
        self.file_seconds += (written + 1) as f64 * block_seconds;
        self.state = AcquisitionState::RecordingAfterTrigger { quiet_cycles: 0 };
        Ok(bytes)
    }

    fn open_session(&mut self, lists: SaveLists, timestamp_offset: u32) -> DaqResult<()> {
        let per_minute = lists.bytes_per_minute(
            self.serializer.format(),
            self.serializer.save_temperature(),
            self.serializer.save_ttl_out(),
            self.board.sample_rate(),
        );
        let path = self
            .serializer
            .begin_session(lists, self.header.clone(), timestamp_offset)?;
        info!("Writing {:.1} MB per minute", per_minute / (1024.0 * 1024.0));
        self.file_seconds = 0.0;
        self.events.push(FileEvent::Opened(path));
        Ok(())
    }

    fn close_session(&mut self) -> DaqResult<()> {
        let path = self.serializer.location().map(Path::to_path_buf);
        let result = self.serializer.end_session();
        if let Some(path) = path {
            self.events.push(FileEvent::Closed(path));
        }
        result
    }

    fn abort_recording(&mut self, cause: &DaqError) {
        error!("Recording aborted: {cause}");
        if let Err(e) = self.close_session() {
            error!("Closing recording failed: {e}");
        }
        self.trigger = None;
        self.pre_trigger.clear();
        if self.state != AcquisitionState::Idle {
            self.state = AcquisitionState::Running;
        }
    }
}
