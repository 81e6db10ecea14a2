use crate::{
    SaveFormat, TriggerSource, AUX_INPUTS, BOARD_ADC_CHANNELS, CHANNELS_PER_STREAM,
    DIGITAL_CHANNELS, SAMPLES_PER_BLOCK,
};
use serde::Deserialize;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalType {
    Amplifier,
    AuxInput,
    SupplyVoltage,
    BoardAdc,
    BoardDigitalIn,
    BoardDigitalOut,
}

impl SignalType {
    /// Code stored in session headers.
    pub fn code(self) -> i16 {
        match self {
            SignalType::Amplifier => 0,
            SignalType::AuxInput => 1,
            SignalType::SupplyVoltage => 2,
            SignalType::BoardAdc => 3,
            SignalType::BoardDigitalIn => 4,
            SignalType::BoardDigitalOut => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub native_name: String,
    pub custom_name: String,
    pub signal_type: SignalType,
    /// Position inside the owning signal group.
    pub native_number: usize,
    pub board_stream: usize,
    pub chip_channel: usize,
    pub enabled: bool,
    pub impedance_magnitude: f64,
    pub impedance_phase: f64,
}

impl ChannelDescriptor {
    fn new(
        name: String,
        signal_type: SignalType,
        native_number: usize,
        board_stream: usize,
        chip_channel: usize,
        enabled: bool,
    ) -> Self {
        Self {
            custom_name: name.clone(),
            native_name: name,
            signal_type,
            native_number,
            board_stream,
            chip_channel,
            enabled,
            impedance_magnitude: 0.0,
            impedance_phase: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalGroup {
    pub name: String,
    pub prefix: String,
    pub enabled: bool,
    pub channels: Vec<ChannelDescriptor>,
}

impl SignalGroup {
    pub fn num_amplifier_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.signal_type == SignalType::Amplifier)
            .count()
    }
}

/// Ordered channel descriptors, grouped by port.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelCatalog {
    pub groups: Vec<SignalGroup>,
}

impl ChannelCatalog {
    /// Catalog for `num_streams` 32-channel chips plus the interface board I/O.
    /// Chip signals start enabled, board I/O starts disabled.
    pub fn standard(num_streams: usize) -> Self {
        let mut groups = Vec::with_capacity(num_streams + 3);
        for stream in 0..num_streams {
            let prefix = char::from(b'A' + stream as u8).to_string();
            let mut channels = Vec::new();
            for ch in 0..CHANNELS_PER_STREAM {
                channels.push(ChannelDescriptor::new(
                    format!("{prefix}-{ch:03}"),
                    SignalType::Amplifier,
                    ch,
                    stream,
                    ch,
                    true,
                ));
            }
            for input in 0..AUX_INPUTS {
                channels.push(ChannelDescriptor::new(
                    format!("{prefix}-AUX{}", input + 1),
                    SignalType::AuxInput,
                    CHANNELS_PER_STREAM + input,
                    stream,
                    input,
                    true,
                ));
            }
            channels.push(ChannelDescriptor::new(
                format!("{prefix}-VDD1"),
                SignalType::SupplyVoltage,
                CHANNELS_PER_STREAM + AUX_INPUTS,
                stream,
                0,
                true,
            ));
            groups.push(SignalGroup {
                name: format!("Stream {prefix}"),
                prefix,
                enabled: true,
                channels,
            });
        }
        groups.push(board_group(
            "Board ADC Inputs",
            "ADC",
            SignalType::BoardAdc,
            BOARD_ADC_CHANNELS,
        ));
        groups.push(board_group(
            "Board Digital Inputs",
            "DIN",
            SignalType::BoardDigitalIn,
            DIGITAL_CHANNELS,
        ));
        groups.push(board_group(
            "Board Digital Outputs",
            "DOUT",
            SignalType::BoardDigitalOut,
            DIGITAL_CHANNELS,
        ));
        Self { groups }
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.groups.iter().flat_map(|g| g.channels.iter())
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut ChannelDescriptor> {
        self.groups.iter_mut().flat_map(|g| g.channels.iter_mut())
    }

    pub fn find_amplifier_mut(
        &mut self,
        stream: usize,
        chip_channel: usize,
    ) -> Option<&mut ChannelDescriptor> {
        self.channels_mut().find(|c| {
            c.signal_type == SignalType::Amplifier
                && c.board_stream == stream
                && c.chip_channel == chip_channel
        })
    }

    /// Enable or disable a channel by native name; returns false if no channel matched.
    pub fn set_enabled(&mut self, native_name: &str, enabled: bool) -> bool {
        match self.channels_mut().find(|c| c.native_name == native_name) {
            Some(channel) => {
                channel.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Build the per-signal-type save lists for a new recording session.
    ///
    /// `trigger` forces its channel into the lists. Digital outputs are saved
    /// only when `save_ttl_out` is set.
    pub fn save_lists(&self, trigger: Option<TriggerSource>, save_ttl_out: bool) -> SaveLists {
        let mut lists = SaveLists::default();
        for channel in self.channels() {
            let forced = match (trigger, channel.signal_type) {
                (Some(TriggerSource::BoardAdc(n)), SignalType::BoardAdc) => {
                    channel.native_number == n
                }
                (Some(TriggerSource::DigitalIn(n)), SignalType::BoardDigitalIn) => {
                    channel.native_number == n
                }
                _ => false,
            };
            let included = match channel.signal_type {
                SignalType::BoardDigitalOut => save_ttl_out,
                _ => channel.enabled || forced,
            };
            if channel.signal_type == SignalType::SupplyVoltage {
                lists.temp_sensors.push(channel.clone());
            }
            if !included {
                continue;
            }
            let list = match channel.signal_type {
                SignalType::Amplifier => &mut lists.amplifier,
                SignalType::AuxInput => &mut lists.aux_input,
                SignalType::SupplyVoltage => &mut lists.supply_voltage,
                SignalType::BoardAdc => &mut lists.board_adc,
                SignalType::BoardDigitalIn => &mut lists.board_digital_in,
                SignalType::BoardDigitalOut => &mut lists.board_digital_out,
            };
            list.push(channel.clone());
        }
        lists
    }
}

fn board_group(name: &str, prefix: &str, signal_type: SignalType, count: usize) -> SignalGroup {
    let channels = (0..count)
        .map(|n| {
            ChannelDescriptor::new(format!("{prefix}-{n:02}"), signal_type, n, 0, n, false)
        })
        .collect();
    SignalGroup {
        name: name.to_string(),
        prefix: prefix.to_string(),
        enabled: true,
        channels,
    }
}

/// Channels captured by one recording session, fixed for its duration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveLists {
    pub amplifier: Vec<ChannelDescriptor>,
    pub aux_input: Vec<ChannelDescriptor>,
    pub supply_voltage: Vec<ChannelDescriptor>,
    pub board_adc: Vec<ChannelDescriptor>,
    pub board_digital_in: Vec<ChannelDescriptor>,
    pub board_digital_out: Vec<ChannelDescriptor>,
    /// Every supply-voltage channel, enabled or not; one sensor per chip.
    pub temp_sensors: Vec<ChannelDescriptor>,
}

impl SaveLists {
    pub fn any_digital_in(&self) -> bool {
        !self.board_digital_in.is_empty()
    }

    /// Bytes one block occupies on disk in `format`.
    pub fn bytes_per_block(
        &self,
        format: SaveFormat,
        save_temperature: bool,
        save_ttl_out: bool,
    ) -> usize {
        let full = 2 * SAMPLES_PER_BLOCK;
        let mut bytes = 4 * SAMPLES_PER_BLOCK;
        bytes += full * self.amplifier.len();
        bytes += full * self.board_adc.len();
        match format {
            SaveFormat::Intan => {
                bytes += 2 * (SAMPLES_PER_BLOCK / 4) * self.aux_input.len();
                bytes += 2 * self.supply_voltage.len();
                if save_temperature {
                    bytes += 2 * self.temp_sensors.len();
                }
            }
            SaveFormat::FilePerSignalType | SaveFormat::FilePerChannel => {
                bytes += full * self.aux_input.len();
                bytes += full * self.supply_voltage.len();
            }
        }
        match format {
            SaveFormat::Intan | SaveFormat::FilePerSignalType => {
                if self.any_digital_in() {
                    bytes += full;
                }
                if save_ttl_out {
                    bytes += full;
                }
            }
            SaveFormat::FilePerChannel => {
                bytes += full * self.board_digital_in.len();
                bytes += full * self.board_digital_out.len();
            }
        }
        bytes
    }

    pub fn bytes_per_minute(
        &self,
        format: SaveFormat,
        save_temperature: bool,
        save_ttl_out: bool,
        sample_rate: f64,
    ) -> f64 {
        let per_block = self.bytes_per_block(format, save_temperature, save_ttl_out) as f64;
        per_block * sample_rate / SAMPLES_PER_BLOCK as f64 * 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_layout() {
        let catalog = ChannelCatalog::standard(2);
        assert_eq!(catalog.groups.len(), 5);
        assert_eq!(catalog.groups[1].channels[0].native_name, "B-000");
        assert_eq!(catalog.groups[0].num_amplifier_channels(), 32);
        assert_eq!(catalog.channels().count(), 2 * 36 + 8 + 16 + 16);
    }

    #[test]
    fn save_lists_follow_enabled_flags() {
        let mut catalog = ChannelCatalog::standard(1);
        assert!(catalog.set_enabled("A-005", false));
        assert!(catalog.set_enabled("DIN-03", true));
        assert!(!catalog.set_enabled("nope", true));
        let lists = catalog.save_lists(None, false);
        assert_eq!(lists.amplifier.len(), 31);
        assert_eq!(lists.aux_input.len(), 3);
        assert_eq!(lists.supply_voltage.len(), 1);
        assert!(lists.board_adc.is_empty());
        assert_eq!(lists.board_digital_in.len(), 1);
        assert!(lists.board_digital_out.is_empty());
    }

    #[test]
    fn temperature_sensors_ignore_enable_flag() {
        let mut catalog = ChannelCatalog::standard(2);
        catalog.set_enabled("A-VDD1", false);
        let lists = catalog.save_lists(None, false);
        assert_eq!(lists.supply_voltage.len(), 1);
        assert_eq!(lists.temp_sensors.len(), 2);
    }

    #[test]
    fn trigger_channel_is_forced_into_lists() {
        let catalog = ChannelCatalog::standard(1);
        let lists = catalog.save_lists(Some(TriggerSource::BoardAdc(2)), false);
        assert_eq!(lists.board_adc.len(), 1);
        assert_eq!(lists.board_adc[0].native_name, "ADC-02");
        let lists = catalog.save_lists(Some(TriggerSource::DigitalIn(7)), true);
        assert_eq!(lists.board_digital_in[0].native_name, "DIN-07");
        assert_eq!(lists.board_digital_out.len(), 16);
    }

    #[test]
    fn bytes_per_block_by_format() {
        let catalog = ChannelCatalog::standard(1);
        let lists = catalog.save_lists(None, false);
        // 240 ts + 32*120 amp + 3*30 aux + 2 supply + 2 temp
        assert_eq!(
            lists.bytes_per_block(SaveFormat::Intan, true, false),
            240 + 3840 + 90 + 2 + 2
        );
        assert_eq!(
            lists.bytes_per_block(SaveFormat::FilePerSignalType, false, true),
            240 + 3840 + 360 + 120 + 120
        );
        let minute = lists.bytes_per_minute(SaveFormat::Intan, false, false, 20000.0);
        assert!((minute - 4172.0 * 20000.0).abs() < 1e-6);
    }
}
