use crate::{
    amplifier_microvolts, BlockQueue, BoardDriver, CapacitorRange, ChannelCatalog, DaqError,
    DaqResult, SignalType, CHANNELS_PER_STREAM, IMPEDANCE_DAC_VOLTS, IMPEDANCE_PIPELINE_DELAY,
    PARASITIC_CAPACITANCE, SAMPLES_PER_BLOCK,
};
use log::{info, warn};
use ndarray::{Array2, Array3};
use std::{
    f64::consts::PI,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

pub const MIN_TEST_PERIOD: usize = 4;
pub const MAX_TEST_PERIOD: usize = 1024;
/// Fewest whole periods a channel is measured over.
pub const MIN_TEST_PERIODS: usize = 5;
/// Periods captured ahead of the measurement window to let the excitation settle.
pub const SETTLE_PERIODS: usize = 2;
/// Largest capture any valid test frequency needs, in blocks.
pub const MAX_BLOCKS: usize =
    ((MIN_TEST_PERIODS + SETTLE_PERIODS) * MAX_TEST_PERIOD).div_ceil(SAMPLES_PER_BLOCK);
/// Measured amplitude the capacitor range selection aims for.
const BEST_AMPLITUDE_MICROVOLTS: f64 = 250.0;

/// Amplifier bandwidth and requested test frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedanceSettings {
    pub desired_frequency: f64,
    pub lower_bandwidth: f64,
    pub upper_bandwidth: f64,
    pub dsp_enabled: bool,
    pub dsp_cutoff: f64,
}

impl Default for ImpedanceSettings {
    fn default() -> Self {
        Self {
            desired_frequency: 1000.0,
            lower_bandwidth: 0.1,
            upper_bandwidth: 7500.0,
            dsp_enabled: true,
            dsp_cutoff: 1.0,
        }
    }
}

impl ImpedanceSettings {
    /// Frequencies far enough inside the amplifier passband to be measured.
    pub fn frequency_limits(&self) -> (f64, f64) {
        let mut lower = 1.5 * self.lower_bandwidth;
        if self.dsp_enabled && self.dsp_cutoff > self.lower_bandwidth {
            lower = 1.5 * self.dsp_cutoff;
        }
        (lower, self.upper_bandwidth / 1.5)
    }
}

/// Capture geometry for one test frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedancePlan {
    /// Achievable frequency, a whole number of samples per period.
    pub frequency: f64,
    pub period: usize,
    pub num_periods: usize,
    pub num_blocks: usize,
}

impl ImpedancePlan {
    pub fn new(settings: &ImpedanceSettings, sample_rate: f64) -> DaqResult<Self> {
        let invalid = || DaqError::InvalidImpedanceFrequency {
            frequency: settings.desired_frequency,
            sample_rate,
        };
        let desired = settings.desired_frequency;
        if !desired.is_finite() || desired <= 0.0 {
            return Err(invalid());
        }
        let (lower, upper) = settings.frequency_limits();
        let period = (sample_rate / desired).round();
        if period < MIN_TEST_PERIOD as f64
            || period > MAX_TEST_PERIOD as f64
            || desired < lower
            || desired > upper
        {
            return Err(invalid());
        }
        let period = period as usize;
        let frequency = sample_rate / period as f64;
        let num_periods = ((0.02 * frequency).round() as usize).max(MIN_TEST_PERIODS);
        let num_blocks = ((num_periods + SETTLE_PERIODS) * period)
            .div_ceil(SAMPLES_PER_BLOCK)
            .max(2);
        Ok(Self {
            frequency,
            period,
            num_periods,
            num_blocks,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.num_blocks * SAMPLES_PER_BLOCK
    }
}

/// Magnitude and phase in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Phasor {
    pub magnitude: f64,
    pub phase: f64,
}

impl Phasor {
    pub fn from_rectangular(re: f64, im: f64) -> Self {
        Self {
            magnitude: re.hypot(im),
            phase: im.atan2(re).to_degrees(),
        }
    }

    pub fn to_rectangular(self) -> (f64, f64) {
        let radians = self.phase.to_radians();
        (
            self.magnitude * radians.cos(),
            self.magnitude * radians.sin(),
        )
    }

    /// Remove a capacitance that sits in parallel with the impedance.
    pub fn factor_out_parallel_capacitance(self, frequency: f64, capacitance: f64) -> Self {
        let (r, x) = self.to_rectangular();
        let cap_term = 2.0 * PI * frequency * capacitance;
        let x_term = cap_term * (r * r + x * x);
        let denominator = cap_term * x_term + 2.0 * cap_term * x + 1.0;
        Self::from_rectangular(r / denominator, (x + x_term) / denominator)
    }

    /// Correction of the resistive part, significant only below 15 kS/s.
    pub fn empirical_resistance_correction(self, sample_rate: f64) -> Self {
        let (r, x) = self.to_rectangular();
        let factor =
            10.0 * (-sample_rate / 2500.0).exp() * (2.0 * PI * sample_rate / 15000.0).cos() + 1.0;
        Self::from_rectangular(r / factor, x)
    }

    /// Series RC circuit with the same impedance at `frequency`: (ohms, farads).
    pub fn series_rc(self, frequency: f64) -> (f64, f64) {
        let (r, x) = self.to_rectangular();
        (r, 1.0 / (2.0 * PI * frequency * -x))
    }
}

/// In-phase and quadrature amplitude of `frequency` in `data[start..=end]`.
fn frequency_component(
    data: &[f64],
    start: usize,
    end: usize,
    sample_rate: f64,
    frequency: f64,
) -> (f64, f64) {
    let k = 2.0 * PI * frequency / sample_rate;
    let (mut i, mut q) = (0.0, 0.0);
    for (t, &x) in data.iter().enumerate().take(end + 1).skip(start) {
        let w = k * t as f64;
        i += x * w.cos();
        q -= x * w.sin();
    }
    let length = (end - start + 1) as f64;
    (2.0 * i / length, 2.0 * q / length)
}

/// Synchronous demodulation of a captured waveform in microvolts.
///
/// The window spans `num_periods` whole periods and is pushed as late in the
/// capture as it fits, so the start-up transient is ignored.
pub fn measure_complex_amplitude(data: &[f64], plan: &ImpedancePlan, sample_rate: f64) -> Phasor {
    let captured = data.len().min(plan.num_samples());
    let mut start = 0;
    let mut end = plan.num_periods * plan.period - 1;
    while end + plan.period < captured {
        start += plan.period;
        end += plan.period;
    }
    let end = end.min(captured.saturating_sub(1));
    let (i, q) = frequency_component(data, start, end, sample_rate, plan.frequency);
    Phasor::from_rectangular(i, q)
}

/// Electrode impedance from the demodulated response at each capacitor range.
///
/// The range whose amplitude is closest to 250 µV on a log scale is used.
pub fn electrode_impedance(
    measured: &[Phasor; 3],
    plan: &ImpedancePlan,
    sample_rate: f64,
) -> (Phasor, CapacitorRange) {
    let mut best = CapacitorRange::Small;
    let mut min_distance = f64::INFINITY;
    for range in CapacitorRange::ALL {
        let distance = (measured[range.index()].magnitude / BEST_AMPLITUDE_MICROVOLTS)
            .ln()
            .abs();
        if distance < min_distance {
            best = range;
            min_distance = distance;
        }
    }

    let response = measured[best.index()];
    let current = 2.0 * PI * plan.frequency * IMPEDANCE_DAC_VOLTS * best.capacitance();
    let relative = plan.frequency / sample_rate;
    let raw = Phasor {
        magnitude: 1.0e-6 * (response.magnitude / current) * (18.0 * relative * relative + 1.0),
        phase: response.phase + 360.0 * (IMPEDANCE_PIPELINE_DELAY / plan.period as f64),
    };
    let impedance = raw
        .factor_out_parallel_capacitance(plan.frequency, PARASITIC_CAPACITANCE)
        .empirical_resistance_correction(sample_rate);
    (impedance, best)
}

/// Electrode impedance of every amplifier channel, indexed `(stream, channel)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpedanceTable {
    pub frequency: f64,
    pub magnitude: Array2<f64>,
    pub phase: Array2<f64>,
}

impl ImpedanceTable {
    pub fn get(&self, stream: usize, channel: usize) -> Phasor {
        Phasor {
            magnitude: self.magnitude[[stream, channel]],
            phase: self.phase[[stream, channel]],
        }
    }

    /// Store the results on the matching amplifier descriptors.
    pub fn apply_to(&self, catalog: &mut ChannelCatalog) {
        let (streams, channels) = self.magnitude.dim();
        for stream in 0..streams {
            for channel in 0..channels {
                if let Some(descriptor) = catalog.find_amplifier_mut(stream, channel) {
                    descriptor.impedance_magnitude = self.magnitude[[stream, channel]];
                    descriptor.impedance_phase = self.phase[[stream, channel]];
                }
            }
        }
    }

    pub fn write_csv(&self, catalog: &ChannelCatalog, out: &mut impl Write) -> io::Result<()> {
        let f = self.frequency;
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record([
            "Channel Number".to_string(),
            "Channel Name".to_string(),
            "Port".to_string(),
            "Enabled".to_string(),
            format!("Impedance Magnitude at {f:.1} Hz (ohms)"),
            format!("Impedance Phase at {f:.1} Hz (degrees)"),
            "Series RC equivalent R (Ohms)".to_string(),
            "Series RC equivalent C (Farads)".to_string(),
        ])?;
        let streams = self.magnitude.dim().0;
        for group in &catalog.groups {
            for c in &group.channels {
                if c.signal_type != SignalType::Amplifier || c.board_stream >= streams {
                    continue;
                }
                let z = self.get(c.board_stream, c.chip_channel);
                let (r, cap) = z.series_rc(f);
                writer.write_record([
                    c.native_name.clone(),
                    c.custom_name.clone(),
                    group.name.clone(),
                    (c.enabled as u8).to_string(),
                    format!("{:.2e}", z.magnitude),
                    format!("{:.0}", z.phase),
                    format!("{r:.2e}"),
                    format!("{cap:.2e}"),
                ])?;
            }
        }
        writer.flush()
    }

    pub fn save_csv(&self, catalog: &ChannelCatalog, path: &Path) -> DaqResult<()> {
        let mut file = File::create(path).map_err(|source| DaqError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.write_csv(catalog, &mut file)?;
        info!("Impedances saved to {}", path.display());
        Ok(())
    }
}

/// Runs an electrode impedance sweep on a stopped board.
pub struct ImpedanceMeasurer {
    settings: ImpedanceSettings,
}

impl ImpedanceMeasurer {
    pub fn new(settings: ImpedanceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ImpedanceSettings {
        &self.settings
    }

    /// Sweep every chip channel through the three capacitor ranges.
    ///
    /// `cancel` is checked before each channel; a cancelled sweep returns
    /// `Ok(None)`. The board is returned to recording configuration, stopped
    /// and flushed on every exit path. `progress` receives `(done, total)`.
    pub fn measure<B: BoardDriver>(
        &self,
        board: &mut B,
        cancel: &AtomicBool,
        mut progress: impl FnMut(usize, usize),
    ) -> DaqResult<Option<ImpedanceTable>> {
        let sample_rate = board.sample_rate();
        let plan = ImpedancePlan::new(&self.settings, sample_rate)?;
        info!(
            "Measuring impedance at {:.1} Hz ({} periods, {} blocks per channel)",
            plan.frequency, plan.num_periods, plan.num_blocks
        );

        board.stop();
        board.flush();
        let result = board
            .configure_impedance_test(plan.frequency)
            .and_then(|_| self.sweep(board, &plan, cancel, &mut progress));
        let restored = board.restore_after_impedance();
        board.stop();
        board.flush();

        let table = result?;
        restored?;
        Ok(table)
    }

    fn sweep<B: BoardDriver>(
        &self,
        board: &mut B,
        plan: &ImpedancePlan,
        cancel: &AtomicBool,
        progress: &mut impl FnMut(usize, usize),
    ) -> DaqResult<Option<ImpedanceTable>> {
        let sample_rate = board.sample_rate();
        let streams = board.num_streams();
        let total = CapacitorRange::ALL.len() * CHANNELS_PER_STREAM;
        let mut measured = Array3::<Phasor>::default((streams, CHANNELS_PER_STREAM, 3));
        let mut queue = BlockQueue::new();

        for range in CapacitorRange::ALL {
            info!(
                "Impedance sweep with {:.1} pF series capacitor",
                range.capacitance() * 1e12
            );
            for channel in 0..CHANNELS_PER_STREAM {
                if cancel.load(Ordering::Relaxed) {
                    warn!("Impedance sweep cancelled at channel {channel}");
                    return Ok(None);
                }
                progress(range.index() * CHANNELS_PER_STREAM + channel, total);

                board.select_impedance_channel(range, channel)?;
                board.start_fixed_length(plan.num_samples())?;
                while !board.read_blocks(plan.num_blocks, &mut queue)? {
                    if !board.is_running() {
                        return Err(DaqError::Board(format!(
                            "capture ended before {} blocks arrived",
                            plan.num_blocks
                        )));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                let blocks = queue.take(plan.num_blocks);

                for stream in 0..streams {
                    let data: Vec<f64> = blocks
                        .iter()
                        .flat_map(|b| {
                            (0..SAMPLES_PER_BLOCK).map(move |t| {
                                amplifier_microvolts(b.amplifier[[stream, channel, t]])
                            })
                        })
                        .collect();
                    measured[[stream, channel, range.index()]] =
                        measure_complex_amplitude(&data, plan, sample_rate);
                }
            }
        }
        progress(total, total);

        let mut table = ImpedanceTable {
            frequency: plan.frequency,
            magnitude: Array2::zeros((streams, CHANNELS_PER_STREAM)),
            phase: Array2::zeros((streams, CHANNELS_PER_STREAM)),
        };
        for stream in 0..streams {
            for channel in 0..CHANNELS_PER_STREAM {
                let responses = [
                    measured[[stream, channel, 0]],
                    measured[[stream, channel, 1]],
                    measured[[stream, channel, 2]],
                ];
                let (z, _) = electrode_impedance(&responses, plan, sample_rate);
                table.magnitude[[stream, channel]] = z.magnitude;
                table.phase[[stream, channel]] = z.phase;
            }
        }
        Ok(Some(table))
    }
}
