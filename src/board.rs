use crate::{
    amplifier_code, BlockQueue, DaqError, DaqResult, SampleBlock, AUX_INPUTS,
    CHANNELS_PER_STREAM, MAX_STREAMS, SAMPLES_PER_BLOCK,
};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{f64::consts::PI, time::Instant};

/// Parasitic capacitance seen in parallel with every electrode, in farads.
pub const PARASITIC_CAPACITANCE: f64 = 10.0e-12;
/// Peak excitation voltage of the impedance test DAC (128 of 256 steps of 1.225 V).
pub const IMPEDANCE_DAC_VOLTS: f64 = 128.0 * 1.225 / 256.0;
/// Samples between the excitation and its appearance in the amplifier stream.
pub const IMPEDANCE_PIPELINE_DELAY: f64 = 3.0;

/// Series calibration capacitor switched in during an impedance test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacitorRange {
    Small,
    Medium,
    Large,
}

impl CapacitorRange {
    pub const ALL: [CapacitorRange; 3] = [
        CapacitorRange::Small,
        CapacitorRange::Medium,
        CapacitorRange::Large,
    ];

    pub fn capacitance(self) -> f64 {
        match self {
            CapacitorRange::Small => 0.1e-12,
            CapacitorRange::Medium => 1.0e-12,
            CapacitorRange::Large => 10.0e-12,
        }
    }

    pub fn index(self) -> usize {
        match self {
            CapacitorRange::Small => 0,
            CapacitorRange::Medium => 1,
            CapacitorRange::Large => 2,
        }
    }
}

/// Interface to the acquisition hardware.
///
/// The driver owns the USB transport and the chip command lists; it hands
/// complete blocks to a [`BlockQueue`] and reports how far its FIFO has filled.
pub trait BoardDriver {
    fn num_streams(&self) -> usize;
    fn sample_rate(&self) -> f64;
    fn start_continuous(&mut self) -> DaqResult<()>;
    /// Acquire `num_samples` samples, rounded up to whole blocks, then stop.
    fn start_fixed_length(&mut self, num_samples: usize) -> DaqResult<()>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn fifo_occupancy_words(&self) -> usize;
    fn fifo_capacity_words(&self) -> usize;
    /// Move `count` blocks into `queue` if at least that many are ready.
    /// Returns `false`, leaving the queue untouched, when they are not.
    fn read_blocks(&mut self, count: usize, queue: &mut BlockQueue) -> DaqResult<bool>;
    /// Discard everything waiting in the FIFO.
    fn flush(&mut self);
    /// Load the sinusoidal excitation for a test at `frequency` Hz.
    fn configure_impedance_test(&mut self, frequency: f64) -> DaqResult<()>;
    /// Route the excitation through `range` onto chip channel `channel` of every stream.
    fn select_impedance_channel(&mut self, range: CapacitorRange, channel: usize) -> DaqResult<()>;
    /// Put the chips back into normal recording configuration.
    fn restore_after_impedance(&mut self) -> DaqResult<()>;
}

#[derive(Debug, Clone, Copy)]
enum Pacing {
    Continuous { started: Instant, delivered: u64 },
    Fixed { remaining: usize },
}

#[derive(Debug, Clone, Copy)]
struct ImpedanceDrive {
    period: usize,
    range: CapacitorRange,
    channel: usize,
}

/// Software stand-in for the interface board.
///
/// In continuous mode blocks become ready at the configured sample rate. Chips
/// carry amplifier noise with a 60 Hz component, DIN-00 pulses for 50 ms every
/// two seconds and ADC-00 swings sinusoidally across the analog trigger
/// threshold. During an impedance test each electrode behaves as a resistor in
/// parallel with the parasitic capacitance.
pub struct SyntheticBoard {
    num_streams: usize,
    sample_rate: f64,
    fifo_capacity_words: usize,
    running: bool,
    pacing: Pacing,
    timestamp: u32,
    /// Sample index inside the current run, used for the periodic test signals.
    tick: u64,
    rng: StdRng,
    test_frequency: Option<f64>,
    drive: Option<ImpedanceDrive>,
    pub electrode_ohms: f64,
}

impl SyntheticBoard {
    pub fn new(
        num_streams: usize,
        sample_rate: f64,
        fifo_capacity_words: usize,
    ) -> DaqResult<Self> {
        if num_streams == 0 || num_streams > MAX_STREAMS {
            return Err(DaqError::InvalidSettings(format!(
                "{num_streams} data streams; 1-{MAX_STREAMS} supported"
            )));
        }
        if sample_rate.is_nan() || sample_rate <= 0.0 {
            return Err(DaqError::InvalidSettings(format!(
                "sample rate {sample_rate}"
            )));
        }
        Ok(Self {
            num_streams,
            sample_rate,
            fifo_capacity_words,
            running: false,
            pacing: Pacing::Fixed { remaining: 0 },
            timestamp: 0,
            tick: 0,
            rng: StdRng::seed_from_u64(0x2164),
            test_frequency: None,
            drive: None,
            electrode_ohms: 1.0e6,
        })
    }

    fn words_per_block(&self) -> usize {
        SampleBlock::words_per_block(self.num_streams)
    }

    fn ready_blocks(&self) -> usize {
        if !self.running {
            return 0;
        }
        match self.pacing {
            Pacing::Continuous { started, delivered } => {
                let produced = started.elapsed().as_secs_f64() * self.sample_rate
                    / SAMPLES_PER_BLOCK as f64;
                (produced as u64).saturating_sub(delivered) as usize
            }
            Pacing::Fixed { remaining } => remaining,
        }
    }

    /// Complex impedance seen at the amplifier input: the electrode in parallel
    /// with the parasitic capacitance.
    fn measured_impedance(&self, frequency: f64) -> (f64, f64) {
        let r = self.electrode_ohms;
        let wrc = 2.0 * PI * frequency * r * PARASITIC_CAPACITANCE;
        let denom = 1.0 + wrc * wrc;
        (r / denom, -r * wrc / denom)
    }

    fn next_block(&mut self) -> SampleBlock {
        let mut block = SampleBlock::new(self.num_streams);
        let fs = self.sample_rate;
        let excitation = match (self.drive, self.test_frequency) {
            (Some(drive), Some(frequency)) => {
                let current =
                    2.0 * PI * frequency * IMPEDANCE_DAC_VOLTS * drive.range.capacitance();
                let (re, im) = self.measured_impedance(frequency);
                let rel = frequency / fs;
                let amplitude = 1.0e6 * current * re.hypot(im) / (18.0 * rel * rel + 1.0);
                let phase =
                    im.atan2(re) - 2.0 * PI * IMPEDANCE_PIPELINE_DELAY / drive.period as f64;
                Some((drive, amplitude, phase))
            }
            _ => None,
        };

        for t in 0..SAMPLES_PER_BLOCK {
            let n = self.tick + t as u64;
            let seconds = n as f64 / fs;
            block.timestamp[t] = self.timestamp.wrapping_add(t as u32);

            for stream in 0..self.num_streams {
                for channel in 0..CHANNELS_PER_STREAM {
                    let microvolts = match excitation {
                        Some((drive, amplitude, phase)) => {
                            if channel == drive.channel {
                                let w = 2.0 * PI * n as f64 / drive.period as f64;
                                amplitude * (w + phase).cos()
                            } else {
                                0.0
                            }
                        }
                        None => {
                            50.0 * (2.0 * PI * 60.0 * seconds).sin()
                                + self.rng.random_range(-10.0..10.0)
                        }
                    };
                    block.amplifier[[stream, channel, t]] = amplifier_code(microvolts);
                }
            }

            // DIN-00 high for 50 ms of every 2 s
            if seconds % 2.0 < 0.05 {
                block.ttl_in[t] |= 1;
            }
            let volts = 1.65 + 1.5 * (2.0 * PI * 0.5 * seconds).sin();
            block.board_adc[[0, t]] = (volts / 0.000050354).round().clamp(0.0, 65535.0) as u16;
        }

        for stream in 0..self.num_streams {
            for k in 0..SAMPLES_PER_BLOCK / 4 {
                for input in 0..AUX_INPUTS {
                    // 1.0 V on every auxiliary input
                    block.auxiliary[[stream, 1, 4 * k + input + 1]] = 26738;
                }
            }
            // 3.3 V supply and a 37 C temperature difference
            block.auxiliary[[stream, 1, 28]] = 44118;
            block.auxiliary[[stream, 1, 12]] = 1000;
            block.auxiliary[[stream, 1, 20]] = 1000 + 30685;
        }

        self.tick += SAMPLES_PER_BLOCK as u64;
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_BLOCK as u32);
        block
    }

    fn begin_run(&mut self, pacing: Pacing) {
        self.running = true;
        self.pacing = pacing;
        self.timestamp = 0;
        self.tick = 0;
    }
}

impl BoardDriver for SyntheticBoard {
    fn num_streams(&self) -> usize {
        self.num_streams
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn start_continuous(&mut self) -> DaqResult<()> {
        info!("Synthetic board running at {} S/s", self.sample_rate);
        self.begin_run(Pacing::Continuous {
            started: Instant::now(),
            delivered: 0,
        });
        Ok(())
    }

    fn start_fixed_length(&mut self, num_samples: usize) -> DaqResult<()> {
        let blocks = num_samples.div_ceil(SAMPLES_PER_BLOCK);
        debug!("Synthetic board capturing {blocks} blocks");
        self.begin_run(Pacing::Fixed { remaining: blocks });
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn fifo_occupancy_words(&self) -> usize {
        (self.ready_blocks() * self.words_per_block()).min(self.fifo_capacity_words)
    }

    fn fifo_capacity_words(&self) -> usize {
        self.fifo_capacity_words
    }

    fn read_blocks(&mut self, count: usize, queue: &mut BlockQueue) -> DaqResult<bool> {
        if self.ready_blocks() < count {
            return Ok(false);
        }
        for _ in 0..count {
            let block = self.next_block();
            queue.push(block);
        }
        match &mut self.pacing {
            Pacing::Continuous { delivered, .. } => *delivered += count as u64,
            Pacing::Fixed { remaining } => {
                *remaining -= count;
                if *remaining == 0 {
                    self.running = false;
                }
            }
        }
        Ok(true)
    }

    fn flush(&mut self) {
        let ready = self.ready_blocks();
        match &mut self.pacing {
            Pacing::Continuous { delivered, .. } => *delivered += ready as u64,
            Pacing::Fixed { remaining } => *remaining = 0,
        }
    }

    fn configure_impedance_test(&mut self, frequency: f64) -> DaqResult<()> {
        if frequency.is_nan() || frequency <= 0.0 {
            return Err(DaqError::Board(format!("test frequency {frequency} Hz")));
        }
        self.test_frequency = Some(frequency);
        Ok(())
    }

    fn select_impedance_channel(&mut self, range: CapacitorRange, channel: usize) -> DaqResult<()> {
        let frequency = self
            .test_frequency
            .ok_or_else(|| DaqError::Board("impedance test not configured".into()))?;
        if channel >= CHANNELS_PER_STREAM {
            return Err(DaqError::Board(format!("no chip channel {channel}")));
        }
        let period = (self.sample_rate / frequency).round() as usize;
        self.drive = Some(ImpedanceDrive {
            period,
            range,
            channel,
        });
        Ok(())
    }

    fn restore_after_impedance(&mut self) -> DaqResult<()> {
        self.test_frequency = None;
        self.drive = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_delivers_whole_blocks_then_stops() {
        let mut board = SyntheticBoard::new(2, 20000.0, 1 << 20).unwrap();
        let mut queue = BlockQueue::new();
        board.start_fixed_length(130).unwrap();
        assert_eq!(
            board.fifo_occupancy_words(),
            3 * SampleBlock::words_per_block(2)
        );
        assert!(!board.read_blocks(4, &mut queue).unwrap());
        assert!(queue.is_empty());
        assert!(board.read_blocks(3, &mut queue).unwrap());
        assert_eq!(queue.len(), 3);
        assert!(!board.is_running());
        let blocks = queue.take(3);
        assert_eq!(blocks[1].timestamp[0], 60);
        assert_eq!(blocks[2].num_streams(), 2);
    }

    #[test]
    fn continuous_blocks_follow_wall_clock() {
        let mut board = SyntheticBoard::new(1, 20000.0, 1 << 20).unwrap();
        let mut queue = BlockQueue::new();
        board.start_continuous().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(board.read_blocks(2, &mut queue).unwrap());
        board.flush();
        assert_eq!(board.fifo_occupancy_words(), 0);
        board.stop();
        assert!(!board.read_blocks(1, &mut queue).unwrap());
    }

    #[test]
    fn impedance_drive_appears_on_selected_channel_only() {
        let mut board = SyntheticBoard::new(1, 20000.0, 1 << 20).unwrap();
        let mut queue = BlockQueue::new();
        board.configure_impedance_test(1000.0).unwrap();
        board
            .select_impedance_channel(CapacitorRange::Small, 5)
            .unwrap();
        board.start_fixed_length(60).unwrap();
        board.read_blocks(1, &mut queue).unwrap();
        let block = queue.pop().unwrap();
        let peak = |ch: usize| {
            (0..SAMPLES_PER_BLOCK)
                .map(|t| (block.amplifier[[0, ch, t]] as i32 - 32768).abs())
                .max()
                .unwrap()
        };
        assert!(peak(5) > 1000);
        assert_eq!(peak(4), 0);

        board.restore_after_impedance().unwrap();
        assert!(board
            .select_impedance_channel(CapacitorRange::Small, 5)
            .is_err());
    }

    #[test]
    fn rejects_bad_stream_count() {
        assert!(SyntheticBoard::new(0, 20000.0, 1).is_err());
        assert!(SyntheticBoard::new(9, 20000.0, 1).is_err());
    }
}
