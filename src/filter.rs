use crate::{
    DaqError, DaqResult, SampleBlock, AUX_INPUTS, BOARD_ADC_CHANNELS, CHANNELS_PER_STREAM,
    SAMPLES_PER_BLOCK,
};
use ndarray::{s, Array2, Array3, ArrayView1, Axis, Zip};
use std::f64::consts::PI;

pub fn amplifier_microvolts(code: u16) -> f64 {
    0.195 * (code as f64 - 32768.0)
}

/// Nearest raw amplifier code for a voltage in microvolts, saturating at the ADC rails.
pub fn amplifier_code(microvolts: f64) -> u16 {
    (microvolts / 0.195 + 32768.0).round().clamp(0.0, 65535.0) as u16
}

pub fn aux_input_volts(code: u16) -> f64 {
    0.0000374 * code as f64
}

pub fn supply_volts(code: u16) -> f64 {
    0.0000748 * code as f64
}

pub fn board_adc_volts(code: u16) -> f64 {
    0.000050354 * code as f64
}

pub fn temperature_celsius(code_a: u16, code_b: u16) -> f64 {
    (code_a as f64 - code_b as f64) / 98.9 - 273.15
}

/// Biquad notch coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotchCoefficients {
    pub a1: f64,
    pub a2: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
}

impl NotchCoefficients {
    pub fn new(frequency: f64, bandwidth: f64, sample_rate: f64) -> Self {
        let d = (-PI * bandwidth / sample_rate).exp();
        let a1 = -(1.0 + d * d) * (2.0 * PI * frequency / sample_rate).cos();
        let b0 = (1.0 + d * d) / 2.0;
        Self {
            a1,
            a2: d * d,
            b0,
            b1: a1,
            b2: b0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighpassCoefficients {
    pub a: f64,
    pub b: f64,
}

impl HighpassCoefficients {
    pub fn new(cutoff: f64, sample_rate: f64) -> Self {
        let a = (-2.0 * PI * cutoff / sample_rate).exp();
        Self { a, b: 1.0 - a }
    }
}

/// Rolling history of raw chip temperature readings, newest first.
#[derive(Debug, Clone)]
pub struct TemperatureHistory {
    raw: Array2<f64>,
    length: usize,
    max_length: usize,
}

impl TemperatureHistory {
    pub fn new(num_streams: usize, capacity: usize) -> Self {
        Self {
            raw: Array2::zeros((num_streams, capacity.max(4))),
            length: 0,
            max_length: capacity.max(4),
        }
    }

    /// Clear the history and average over `requested` readings from now on.
    /// The length is kept between 4 and the allocation and rounded down to a multiple of 4.
    pub fn reset(&mut self, requested: usize) {
        let capacity = self.raw.ncols();
        let clamped = requested.max(4).min(capacity);
        self.max_length = clamped - clamped % 4;
        self.length = 0;
        self.raw.fill(0.0);
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn push(&mut self, readings: &[f64]) {
        for (mut row, &reading) in self.raw.axis_iter_mut(Axis(0)).zip(readings) {
            for i in (1..self.max_length).rev() {
                row[i] = row[i - 1];
            }
            row[0] = reading;
        }
        if self.length < self.max_length {
            self.length += 1;
        }
    }

    pub fn average(&self, stream: usize) -> Option<f64> {
        if self.length == 0 {
            return None;
        }
        self.raw
            .slice(s![stream, ..self.length])
            .mean()
    }
}

/// Scales raw block data to physical units and filters amplifier waveforms for display.
///
/// Scratch buffers are sized once for `max_blocks` blocks; `load` rejects larger drains.
pub struct FilterEngine {
    sample_rate: f64,
    num_streams: usize,
    max_blocks: usize,
    num_blocks: usize,
    notch_request: Option<(f64, f64)>,
    highpass_request: Option<f64>,
    notch: Option<NotchCoefficients>,
    highpass: Option<HighpassCoefficients>,
    visible: Array2<bool>,
    amplifier_pre: Array3<f64>,
    amplifier_post: Array3<f64>,
    /// Per channel: pre[t-2], pre[t-1], post[t-2], post[t-1] from the previous load.
    notch_memory: Array3<f64>,
    highpass_state: Array2<f64>,
    aux_input: Array3<f64>,
    supply_voltage: Array2<f64>,
    temperature: Array2<f64>,
    board_adc: Array2<f64>,
    temp_history: TemperatureHistory,
}

impl FilterEngine {
    pub fn new(num_streams: usize, max_blocks: usize, sample_rate: f64) -> Self {
        let max_samples = max_blocks * SAMPLES_PER_BLOCK;
        Self {
            sample_rate,
            num_streams,
            max_blocks,
            num_blocks: 0,
            notch_request: None,
            highpass_request: None,
            notch: None,
            highpass: None,
            visible: Array2::from_elem((num_streams, CHANNELS_PER_STREAM), true),
            amplifier_pre: Array3::zeros((num_streams, CHANNELS_PER_STREAM, max_samples)),
            amplifier_post: Array3::zeros((num_streams, CHANNELS_PER_STREAM, max_samples)),
            notch_memory: Array3::zeros((num_streams, CHANNELS_PER_STREAM, 4)),
            highpass_state: Array2::zeros((num_streams, CHANNELS_PER_STREAM)),
            aux_input: Array3::zeros((num_streams, AUX_INPUTS, max_samples / 4)),
            supply_voltage: Array2::zeros((num_streams, max_blocks)),
            temperature: Array2::zeros((num_streams, max_blocks)),
            board_adc: Array2::zeros((BOARD_ADC_CHANNELS, max_samples)),
            temp_history: TemperatureHistory::new(num_streams, max_blocks),
        }
    }

    /// Reallocate for a new stream count or sample rate; all filter memory is cleared.
    pub fn reset(&mut self, num_streams: usize, sample_rate: f64) {
        let mut fresh = Self::new(num_streams, self.max_blocks, sample_rate);
        if num_streams == self.num_streams {
            fresh.visible = self.visible.clone();
        }
        fresh.set_notch(self.notch_request);
        fresh.set_highpass(self.highpass_request);
        fresh.temp_history.reset(self.temp_history.max_length());
        *self = fresh;
    }

    /// Enable the notch at `(frequency, bandwidth)` in Hz, or disable it with `None`.
    pub fn set_notch(&mut self, notch: Option<(f64, f64)>) {
        self.notch_request = notch;
        self.notch = notch.map(|(f0, bw)| NotchCoefficients::new(f0, bw, self.sample_rate));
    }

    pub fn set_highpass(&mut self, cutoff: Option<f64>) {
        self.highpass_request = cutoff;
        self.highpass = cutoff.map(|fc| HighpassCoefficients::new(fc, self.sample_rate));
    }

    pub fn set_visible(&mut self, stream: usize, channel: usize, visible: bool) {
        self.visible[[stream, channel]] = visible;
    }

    pub fn set_all_visible(&mut self, visible: bool) {
        self.visible.fill(visible);
    }

    pub fn reset_temperature_history(&mut self, requested: usize) {
        self.temp_history.reset(requested);
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn num_samples(&self) -> usize {
        self.num_blocks * SAMPLES_PER_BLOCK
    }

    /// Scale `blocks` into the scratch buffers and run the amplifier filters.
    pub fn load(&mut self, blocks: &[SampleBlock]) -> DaqResult<()> {
        if blocks.len() > self.max_blocks {
            return Err(DaqError::ScratchOverflow {
                count: blocks.len(),
                capacity: self.max_blocks,
            });
        }
        if let Some(block) = blocks.iter().find(|b| b.num_streams() != self.num_streams) {
            return Err(DaqError::InvalidSettings(format!(
                "block carries {} streams, filter expects {}",
                block.num_streams(),
                self.num_streams
            )));
        }
        self.num_blocks = blocks.len();
        if blocks.is_empty() {
            return Ok(());
        }

        for (b, block) in blocks.iter().enumerate() {
            self.scale_block(b, block);
        }
        self.filter();
        Ok(())
    }

    fn scale_block(&mut self, b: usize, block: &SampleBlock) {
        let t0 = b * SAMPLES_PER_BLOCK;
        let span = t0..t0 + SAMPLES_PER_BLOCK;
        self.amplifier_pre
            .slice_mut(s![.., .., span.clone()])
            .zip_mut_with(&block.amplifier, |y, &code| *y = amplifier_microvolts(code));
        self.board_adc
            .slice_mut(s![.., span])
            .zip_mut_with(&block.board_adc, |y, &code| *y = board_adc_volts(code));

        let quarter = SAMPLES_PER_BLOCK / 4;
        let mut readings = Vec::with_capacity(self.num_streams);
        for stream in 0..self.num_streams {
            for input in 0..AUX_INPUTS {
                for k in 0..quarter {
                    self.aux_input[[stream, input, b * quarter + k]] =
                        aux_input_volts(block.aux_input(stream, input, k));
                }
            }
            self.supply_voltage[[stream, b]] = supply_volts(block.supply_voltage(stream));
            let (a, c) = block.temperature_pair(stream);
            readings.push(temperature_celsius(a, c));
        }

        self.temp_history.push(&readings);
        for (stream, reading) in readings.into_iter().enumerate() {
            self.temperature[[stream, b]] = self.temp_history.average(stream).unwrap_or(reading);
        }
    }

    fn filter(&mut self) {
        let n = self.num_samples();
        let notch = self.notch;
        let pre = self.amplifier_pre.slice(s![.., .., ..n]);
        let mut post = self.amplifier_post.slice_mut(s![.., .., ..n]);

        Zip::from(post.lanes_mut(Axis(2)))
            .and(pre.lanes(Axis(2)))
            .and(self.notch_memory.lanes_mut(Axis(2)))
            .and(&self.visible)
            .par_for_each(|mut y, x, mut mem, &visible| {
                match notch {
                    Some(c) if visible => {
                        y[0] = c.b2 * mem[0] + c.b1 * mem[1] + c.b0 * x[0]
                            - c.a2 * mem[2]
                            - c.a1 * mem[3];
                        y[1] = c.b2 * mem[1] + c.b1 * x[0] + c.b0 * x[1]
                            - c.a2 * mem[3]
                            - c.a1 * y[0];
                        for t in 2..n {
                            y[t] = c.b2 * x[t - 2] + c.b1 * x[t - 1] + c.b0 * x[t]
                                - c.a2 * y[t - 2]
                                - c.a1 * y[t - 1];
                        }
                    }
                    _ => y.assign(&x),
                }
                mem[0] = x[n - 2];
                mem[1] = x[n - 1];
                mem[2] = y[n - 2];
                mem[3] = y[n - 1];
            });

        if let Some(hp) = self.highpass {
            Zip::from(post.lanes_mut(Axis(2)))
                .and(&mut self.highpass_state)
                .and(&self.visible)
                .par_for_each(|mut y, state, &visible| {
                    if !visible {
                        return;
                    }
                    for v in y.iter_mut() {
                        let raw = *v;
                        *v -= *state;
                        *state = hp.a * *state + hp.b * raw;
                    }
                });
        }
    }

    /// Scaled, unfiltered amplifier waveform in microvolts.
    pub fn amplifier_pre(&self, stream: usize, channel: usize) -> ArrayView1<'_, f64> {
        self.amplifier_pre
            .slice(s![stream, channel, ..self.num_samples()])
    }

    /// Display waveform after the notch and highpass stages.
    pub fn amplifier_post(&self, stream: usize, channel: usize) -> ArrayView1<'_, f64> {
        self.amplifier_post
            .slice(s![stream, channel, ..self.num_samples()])
    }

    pub fn aux_input(&self, stream: usize, input: usize) -> ArrayView1<'_, f64> {
        self.aux_input
            .slice(s![stream, input, ..self.num_samples() / 4])
    }

    pub fn supply_voltage(&self, stream: usize) -> ArrayView1<'_, f64> {
        self.supply_voltage.slice(s![stream, ..self.num_blocks])
    }

    pub fn board_adc(&self, channel: usize) -> ArrayView1<'_, f64> {
        self.board_adc.slice(s![channel, ..self.num_samples()])
    }

    /// Averaged temperature of every stream as of block `b` of the last load.
    pub fn block_temperatures(&self, b: usize) -> Vec<f64> {
        self.temperature.column(b).to_vec()
    }
}
