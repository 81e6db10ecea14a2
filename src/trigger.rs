use crate::{
    board_adc_volts, DaqError, DaqResult, SampleBlock, BOARD_ADC_CHANNELS, DIGITAL_CHANNELS,
    SAMPLES_PER_BLOCK,
};
use serde::Deserialize;
use std::collections::VecDeque;

/// Analog trigger threshold in volts.
pub const ANALOG_TRIGGER_THRESHOLD: f64 = 1.65;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerPolarity {
    /// Trigger while the input is high (logic 1 or at least 1.65 V).
    Rising,
    /// Trigger while the input is low.
    Falling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    DigitalIn(usize),
    BoardAdc(usize),
}

impl TriggerSource {
    /// Channels 0-15 are digital inputs, 16-23 board ADC inputs.
    pub fn from_channel(channel: u8) -> DaqResult<Self> {
        let ch = channel as usize;
        if ch < DIGITAL_CHANNELS {
            Ok(TriggerSource::DigitalIn(ch))
        } else if ch < DIGITAL_CHANNELS + BOARD_ADC_CHANNELS {
            Ok(TriggerSource::BoardAdc(ch - DIGITAL_CHANNELS))
        } else {
            Err(DaqError::InvalidTriggerChannel(channel))
        }
    }

    /// Whether the monitored line is high at sample `t`.
    pub fn is_high(&self, block: &SampleBlock, t: usize) -> bool {
        match *self {
            TriggerSource::DigitalIn(ch) => block.digital_in(ch, t),
            TriggerSource::BoardAdc(ch) => {
                board_adc_volts(block.board_adc[[ch, t]]) >= ANALOG_TRIGGER_THRESHOLD
            }
        }
    }
}

/// Validated parameters of a triggered, episodic recording.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriggerSettings {
    pub source: TriggerSource,
    pub polarity: TriggerPolarity,
    pub pre_trigger_seconds: f64,
    pub post_trigger_seconds: f64,
    pub save_trigger_channel: bool,
}

impl TriggerSettings {
    pub fn new(
        channel: u8,
        polarity: TriggerPolarity,
        pre_trigger_seconds: f64,
        post_trigger_seconds: f64,
        save_trigger_channel: bool,
    ) -> DaqResult<Self> {
        let settings = Self {
            source: TriggerSource::from_channel(channel)?,
            polarity,
            pre_trigger_seconds,
            post_trigger_seconds,
            save_trigger_channel,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Channel index in the 0-23 numbering used by `new`.
    pub fn channel(&self) -> u8 {
        let index = match self.source {
            TriggerSource::DigitalIn(ch) => ch,
            TriggerSource::BoardAdc(ch) => DIGITAL_CHANNELS + ch,
        };
        index.min(u8::MAX as usize) as u8
    }

    pub fn validate(&self) -> DaqResult<()> {
        let in_range = match self.source {
            TriggerSource::DigitalIn(ch) => ch < DIGITAL_CHANNELS,
            TriggerSource::BoardAdc(ch) => ch < BOARD_ADC_CHANNELS,
        };
        if !in_range {
            return Err(DaqError::InvalidTriggerChannel(self.channel()));
        }
        for (name, value) in [
            ("pre-trigger", self.pre_trigger_seconds),
            ("post-trigger", self.post_trigger_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::InvalidTriggerWindow(format!(
                    "{name} time {value} s"
                )));
            }
        }
        Ok(())
    }

    pub fn is_active(&self, block: &SampleBlock, t: usize) -> bool {
        let high = self.source.is_high(block, t);
        match self.polarity {
            TriggerPolarity::Rising => high,
            TriggerPolarity::Falling => !high,
        }
    }

    /// First sample of `block` at the trigger level.
    pub fn find_trigger(&self, block: &SampleBlock) -> Option<usize> {
        (0..SAMPLES_PER_BLOCK).find(|&t| self.is_active(block, t))
    }

    /// Blocks retained while armed, a whole number of drains plus one.
    pub fn pre_trigger_capacity(&self, blocks_per_drain: usize, sample_rate: f64) -> usize {
        let drain_seconds = (blocks_per_drain * SAMPLES_PER_BLOCK) as f64 / sample_rate;
        let drains = (self.pre_trigger_seconds / drain_seconds).ceil() as usize;
        blocks_per_drain * drains + 1
    }

    /// Quiet drains tolerated before an episode ends; the episode ends on the next one.
    pub fn post_trigger_drains(&self, blocks_per_drain: usize, sample_rate: f64) -> usize {
        let samples = self.post_trigger_seconds * sample_rate;
        let drains = (samples / (blocks_per_drain * SAMPLES_PER_BLOCK) as f64).ceil() as usize;
        drains.saturating_sub(1)
    }
}

/// Bounded history of whole blocks kept while a trigger is armed, oldest first.
#[derive(Debug, Default)]
pub struct PreTriggerBuffer {
    blocks: VecDeque<(SampleBlock, Vec<f64>)>,
    capacity: usize,
}

impl PreTriggerBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a block with its temperature readings, evicting the oldest past capacity.
    pub fn push(&mut self, block: SampleBlock, temperatures: Vec<f64>) {
        self.blocks.push_back((block, temperatures));
        while self.blocks.len() > self.capacity {
            self.blocks.pop_front();
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (SampleBlock, Vec<f64>)> + '_ {
        self.blocks.drain(..)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(channel: u8, polarity: TriggerPolarity, pre: f64, post: f64) -> TriggerSettings {
        TriggerSettings::new(channel, polarity, pre, post, true).unwrap()
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(TriggerSource::from_channel(3).unwrap(), TriggerSource::DigitalIn(3));
        assert_eq!(TriggerSource::from_channel(16).unwrap(), TriggerSource::BoardAdc(0));
        assert_eq!(TriggerSource::from_channel(23).unwrap(), TriggerSource::BoardAdc(7));
        assert!(matches!(
            TriggerSource::from_channel(24),
            Err(DaqError::InvalidTriggerChannel(24))
        ));
    }

    #[test]
    fn hand_built_settings_are_validated() {
        let mut s = settings(20, TriggerPolarity::Falling, 1.0, 1.0);
        assert_eq!(s.channel(), 20);
        s.source = TriggerSource::BoardAdc(9);
        assert!(matches!(s.validate(), Err(DaqError::InvalidTriggerChannel(25))));
    }

    #[test]
    fn negative_window_is_rejected() {
        assert!(TriggerSettings::new(0, TriggerPolarity::Rising, -1.0, 1.0, false).is_err());
        assert!(TriggerSettings::new(0, TriggerPolarity::Rising, 1.0, f64::NAN, false).is_err());
    }

    #[test]
    fn pre_trigger_capacity_rounds_to_whole_drains() {
        let s = settings(0, TriggerPolarity::Rising, 2.0, 1.0);
        // 12 * ceil(2 / 0.036) + 1
        assert_eq!(s.pre_trigger_capacity(12, 20000.0), 673);
        assert_eq!(s.post_trigger_drains(12, 20000.0), 27);
    }

    #[test]
    fn digital_trigger_finds_first_active_sample() {
        let mut block = SampleBlock::new(1);
        block.ttl_in[17] = 1 << 4;
        block.ttl_in[30] = 1 << 4;
        let rising = settings(4, TriggerPolarity::Rising, 1.0, 1.0);
        assert_eq!(rising.find_trigger(&block), Some(17));
        let other = settings(5, TriggerPolarity::Rising, 1.0, 1.0);
        assert_eq!(other.find_trigger(&block), None);
        let falling = settings(4, TriggerPolarity::Falling, 1.0, 1.0);
        assert_eq!(falling.find_trigger(&block), Some(0));
    }

    #[test]
    fn analog_trigger_uses_threshold() {
        let mut block = SampleBlock::new(1);
        block.board_adc[[2, 40]] = 40000;
        let s = settings(18, TriggerPolarity::Rising, 1.0, 1.0);
        assert_eq!(s.find_trigger(&block), Some(40));
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let mut buffer = PreTriggerBuffer::new(3);
        for i in 0..10u32 {
            let mut block = SampleBlock::new(1);
            block.timestamp[0] = i;
            buffer.push(block, vec![]);
            assert!(buffer.len() <= 3);
        }
        let kept: Vec<u32> = buffer.drain().map(|(b, _)| b.timestamp[0]).collect();
        assert_eq!(kept, vec![7, 8, 9]);
        assert!(buffer.is_empty());
    }
}
