use crate::{ChannelCatalog, ChannelDescriptor, SignalGroup};
use std::io::{self, Write};

pub const DATA_FILE_MAGIC_NUMBER: u32 = 0xc691_2702;
pub const DATA_FILE_MAIN_VERSION: i16 = 1;
pub const DATA_FILE_SECONDARY_VERSION: i16 = 5;

/// Acquisition settings recorded at the head of every save file.
#[derive(Debug, Clone)]
pub struct SessionHeader {
    pub sample_rate: f64,
    pub dsp_enabled: bool,
    pub actual_dsp_cutoff: f64,
    pub actual_lower_bandwidth: f64,
    pub actual_upper_bandwidth: f64,
    pub desired_dsp_cutoff: f64,
    pub desired_lower_bandwidth: f64,
    pub desired_upper_bandwidth: f64,
    /// 0 = no notch, 1 = 50 Hz, 2 = 60 Hz.
    pub notch_mode: i16,
    pub desired_impedance_frequency: f64,
    pub actual_impedance_frequency: f64,
    pub notes: [String; 3],
    pub board_mode: i16,
    pub catalog: ChannelCatalog,
}

impl SessionHeader {
    /// Header with default amplifier bandwidth and no notes.
    pub fn new(sample_rate: f64, catalog: ChannelCatalog) -> Self {
        Self {
            sample_rate,
            dsp_enabled: true,
            actual_dsp_cutoff: 1.0,
            actual_lower_bandwidth: 0.1,
            actual_upper_bandwidth: 7500.0,
            desired_dsp_cutoff: 1.0,
            desired_lower_bandwidth: 0.1,
            desired_upper_bandwidth: 7500.0,
            notch_mode: 0,
            desired_impedance_frequency: 1000.0,
            actual_impedance_frequency: 0.0,
            notes: Default::default(),
            board_mode: 0,
            catalog,
        }
    }

    /// Serialize the header; returns the number of bytes written.
    pub fn write_to(&self, out: &mut impl Write, num_temp_sensors: usize) -> io::Result<usize> {
        let mut h = HeaderBytes::default();
        h.u32(DATA_FILE_MAGIC_NUMBER);
        h.i16(DATA_FILE_MAIN_VERSION);
        h.i16(DATA_FILE_SECONDARY_VERSION);
        h.f32(self.sample_rate);
        h.i16(self.dsp_enabled as i16);
        h.f32(self.actual_dsp_cutoff);
        h.f32(self.actual_lower_bandwidth);
        h.f32(self.actual_upper_bandwidth);
        h.f32(self.desired_dsp_cutoff);
        h.f32(self.desired_lower_bandwidth);
        h.f32(self.desired_upper_bandwidth);
        h.i16(self.notch_mode);
        h.f32(self.desired_impedance_frequency);
        h.f32(self.actual_impedance_frequency);
        for note in &self.notes {
            h.string(note);
        }
        h.i16(num_temp_sensors as i16);
        h.i16(self.board_mode);
        h.i16(self.catalog.groups.len() as i16);
        for group in &self.catalog.groups {
            h.group(group);
        }
        out.write_all(&h.bytes)?;
        Ok(h.bytes.len())
    }
}

#[derive(Default)]
struct HeaderBytes {
    bytes: Vec<u8>,
}

impl HeaderBytes {
    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f64) {
        self.bytes.extend_from_slice(&(v as f32).to_le_bytes());
    }

    /// Byte length followed by UTF-16LE code units.
    fn string(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.u32(2 * units.len() as u32);
        for unit in units {
            self.bytes.extend_from_slice(&unit.to_le_bytes());
        }
    }

    fn group(&mut self, group: &SignalGroup) {
        self.string(&group.name);
        self.string(&group.prefix);
        self.i16(group.enabled as i16);
        self.i16(group.channels.len() as i16);
        self.i16(group.num_amplifier_channels() as i16);
        for channel in &group.channels {
            self.channel(channel);
        }
    }

    fn channel(&mut self, c: &ChannelDescriptor) {
        self.string(&c.native_name);
        self.string(&c.custom_name);
        self.i16(c.native_number as i16);
        self.i16(c.native_number as i16);
        self.i16(c.signal_type.code());
        self.i16(c.enabled as i16);
        self.i16(c.chip_channel as i16);
        self.i16(c.board_stream as i16);
        // voltage trigger mode, threshold, digital trigger channel, edge polarity
        self.i16(1);
        self.i16(0);
        self.i16(0);
        self.i16(1);
        self.f32(c.impedance_magnitude);
        self.f32(c.impedance_phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(num_streams: usize) -> SessionHeader {
        let mut header = SessionHeader::new(20000.0, ChannelCatalog::standard(num_streams));
        header.notch_mode = 2;
        header.notes[0] = "a".into();
        header
    }

    #[test]
    fn header_starts_with_magic_and_version() {
        let mut out = Vec::new();
        let n = header(1).write_to(&mut out, 1).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(&out[0..4], &[0x02, 0x27, 0x91, 0xc6]);
        assert_eq!(i16::from_le_bytes([out[4], out[5]]), 1);
        assert_eq!(i16::from_le_bytes([out[6], out[7]]), 5);
        assert_eq!(f32::from_le_bytes([out[8], out[9], out[10], out[11]]), 20000.0);
    }

    #[test]
    fn strings_are_utf16_with_byte_length() {
        let mut h = HeaderBytes::default();
        h.string("A-0");
        assert_eq!(h.bytes, vec![6, 0, 0, 0, b'A', 0, b'-', 0, b'0', 0]);
    }

    #[test]
    fn header_grows_with_catalog() {
        let mut one = Vec::new();
        let mut two = Vec::new();
        header(1).write_to(&mut one, 1).unwrap();
        header(2).write_to(&mut two, 2).unwrap();
        assert!(two.len() > one.len());
    }
}
