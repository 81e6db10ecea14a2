use crate::{DaqError, DaqResult};
use ndarray::{Array1, Array2, Array3};

pub const SAMPLES_PER_BLOCK: usize = 60;
pub const MAX_STREAMS: usize = 8;
pub const CHANNELS_PER_STREAM: usize = 32;
pub const AUX_SLOTS: usize = 3;
pub const AUX_INPUTS: usize = 3;
pub const BOARD_ADC_CHANNELS: usize = 8;
pub const DIGITAL_CHANNELS: usize = 16;
/// Magic number opening every sample of a USB frame.
pub const USB_FRAME_HEADER: u64 = 0xc691_1999_2702_1942;

/// Word offsets inside auxiliary command slot 1.
const SUPPLY_WORD: usize = 28;
const TEMP_A_WORD: usize = 20;
const TEMP_B_WORD: usize = 12;

/// One hardware frame: 60 consecutive samples across all active streams.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub timestamp: Array1<u32>,
    /// Raw amplifier codes, shape `(streams, 32, 60)`.
    pub amplifier: Array3<u16>,
    /// Auxiliary command results, shape `(streams, 3, 60)`.
    pub auxiliary: Array3<u16>,
    /// Board analog inputs, shape `(8, 60)`.
    pub board_adc: Array2<u16>,
    pub ttl_in: Array1<u16>,
    pub ttl_out: Array1<u16>,
}

impl SampleBlock {
    pub fn new(num_streams: usize) -> Self {
        Self {
            timestamp: Array1::zeros(SAMPLES_PER_BLOCK),
            amplifier: Array3::zeros((num_streams, CHANNELS_PER_STREAM, SAMPLES_PER_BLOCK)),
            auxiliary: Array3::zeros((num_streams, AUX_SLOTS, SAMPLES_PER_BLOCK)),
            board_adc: Array2::zeros((BOARD_ADC_CHANNELS, SAMPLES_PER_BLOCK)),
            ttl_in: Array1::zeros(SAMPLES_PER_BLOCK),
            ttl_out: Array1::zeros(SAMPLES_PER_BLOCK),
        }
    }

    pub fn num_streams(&self) -> usize {
        self.amplifier.dim().0
    }

    /// Size of one USB frame in 16-bit words.
    pub fn words_per_block(num_streams: usize) -> usize {
        SAMPLES_PER_BLOCK * (4 + 2 + num_streams * (AUX_SLOTS + CHANNELS_PER_STREAM + 1) + 8 + 2)
    }

    /// Decode one little-endian USB frame.
    pub fn from_usb_bytes(bytes: &[u8], num_streams: usize) -> DaqResult<Self> {
        if num_streams == 0 || num_streams > MAX_STREAMS {
            return Err(DaqError::Frame(format!(
                "{num_streams} data streams requested"
            )));
        }
        let expected = 2 * Self::words_per_block(num_streams);
        if bytes.len() < expected {
            return Err(DaqError::Frame(format!(
                "frame holds {} bytes, {expected} needed",
                bytes.len()
            )));
        }

        let mut block = Self::new(num_streams);
        let mut cursor = FrameCursor { bytes, pos: 0 };
        for t in 0..SAMPLES_PER_BLOCK {
            let header = cursor.u64();
            if header != USB_FRAME_HEADER {
                return Err(DaqError::Frame(format!(
                    "bad header {header:#018x} at sample {t}"
                )));
            }
            block.timestamp[t] = cursor.u32();
            for slot in 0..AUX_SLOTS {
                for stream in 0..num_streams {
                    block.auxiliary[[stream, slot, t]] = cursor.u16();
                }
            }
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..num_streams {
                    block.amplifier[[stream, channel, t]] = cursor.u16();
                }
            }
            // one filler word per stream
            cursor.skip(2 * num_streams);
            for adc in 0..BOARD_ADC_CHANNELS {
                block.board_adc[[adc, t]] = cursor.u16();
            }
            block.ttl_in[t] = cursor.u16();
            block.ttl_out[t] = cursor.u16();
        }
        Ok(block)
    }

    /// Same as `from_usb_bytes` for a frame already split into 16-bit words.
    pub fn from_usb_words(words: &[u16], num_streams: usize) -> DaqResult<Self> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        Self::from_usb_bytes(&bytes, num_streams)
    }

    /// Auxiliary input `input` at quarter-rate sample `k` (0..15).
    pub fn aux_input(&self, stream: usize, input: usize, k: usize) -> u16 {
        self.auxiliary[[stream, 1, 4 * k + input + 1]]
    }

    /// Auxiliary input held over the full-rate tick `t`.
    pub fn aux_input_held(&self, stream: usize, input: usize, t: usize) -> u16 {
        self.aux_input(stream, input, t / 4)
    }

    pub fn supply_voltage(&self, stream: usize) -> u16 {
        self.auxiliary[[stream, 1, SUPPLY_WORD]]
    }

    /// The two temperature sensor readings, differenced to get absolute temperature.
    pub fn temperature_pair(&self, stream: usize) -> (u16, u16) {
        (
            self.auxiliary[[stream, 1, TEMP_A_WORD]],
            self.auxiliary[[stream, 1, TEMP_B_WORD]],
        )
    }

    pub fn digital_in(&self, channel: usize, t: usize) -> bool {
        self.ttl_in[t] & (1 << channel) != 0
    }

    pub fn digital_out(&self, channel: usize, t: usize) -> bool {
        self.ttl_out[t] & (1 << channel) != 0
    }
}

struct FrameCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl FrameCursor<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(num_streams: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for t in 0..SAMPLES_PER_BLOCK {
            out.extend_from_slice(&USB_FRAME_HEADER.to_le_bytes());
            out.extend_from_slice(&(1000 + t as u32).to_le_bytes());
            for slot in 0..AUX_SLOTS {
                for stream in 0..num_streams {
                    let w = (slot * 100 + stream * 10) as u16 + t as u16;
                    out.extend_from_slice(&w.to_le_bytes());
                }
            }
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..num_streams {
                    let w = 32768 + (stream * 1000 + channel * 10 + t) as u16;
                    out.extend_from_slice(&w.to_le_bytes());
                }
            }
            for _ in 0..num_streams {
                out.extend_from_slice(&0xffffu16.to_le_bytes());
            }
            for adc in 0..BOARD_ADC_CHANNELS {
                out.extend_from_slice(&(adc as u16 * 7).to_le_bytes());
            }
            out.extend_from_slice(&(t as u16).to_le_bytes());
            out.extend_from_slice(&0x8000u16.to_le_bytes());
        }
        out
    }

    #[test]
    fn frame_size_matches_words_per_block() {
        assert_eq!(frame(2).len(), 2 * SampleBlock::words_per_block(2));
        assert_eq!(SampleBlock::words_per_block(1), 60 * 52);
    }

    #[test]
    fn decodes_multiplexed_frame() {
        let block = SampleBlock::from_usb_bytes(&frame(2), 2).unwrap();
        assert_eq!(block.num_streams(), 2);
        assert_eq!(block.timestamp[0], 1000);
        assert_eq!(block.timestamp[59], 1059);
        assert_eq!(block.amplifier[[1, 31, 5]], 32768 + 1000 + 310 + 5);
        assert_eq!(block.auxiliary[[1, 2, 3]], 213);
        assert_eq!(block.board_adc[[3, 10]], 21);
        assert_eq!(block.ttl_in[42], 42);
        assert!(block.digital_out(15, 0));
        assert!(!block.digital_out(0, 0));
    }

    #[test]
    fn word_frames_decode_like_byte_frames() {
        let bytes = frame(1);
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(
            SampleBlock::from_usb_words(&words, 1).unwrap(),
            SampleBlock::from_usb_bytes(&bytes, 1).unwrap()
        );
    }

    #[test]
    fn rejects_bad_header() {
        let mut bytes = frame(1);
        bytes[0] ^= 0xff;
        assert!(matches!(
            SampleBlock::from_usb_bytes(&bytes, 1),
            Err(DaqError::Frame(_))
        ));
    }

    #[test]
    fn rejects_short_frame() {
        let bytes = frame(1);
        assert!(SampleBlock::from_usb_bytes(&bytes[..100], 1).is_err());
    }

    #[test]
    fn auxiliary_accessors_follow_slot_layout() {
        let mut block = SampleBlock::new(1);
        for t in 0..SAMPLES_PER_BLOCK {
            block.auxiliary[[0, 1, t]] = t as u16;
        }
        assert_eq!(block.aux_input(0, 0, 0), 1);
        assert_eq!(block.aux_input(0, 2, 14), 59);
        assert_eq!(block.aux_input_held(0, 1, 7), 6);
        assert_eq!(block.supply_voltage(0), 28);
        assert_eq!(block.temperature_pair(0), (20, 12));
    }
}
