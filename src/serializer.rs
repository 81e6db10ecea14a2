use crate::{
    timestamped_stem, unique_path, DaqError, DaqResult, SampleBlock, SaveLists, SessionHeader,
    SAMPLES_PER_BLOCK,
};
use log::info;
use serde::Deserialize;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// On-disk layout, fixed for the duration of a session.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    /// One `.rhd` file, block-grouped, amplifier codes unsigned.
    Intan,
    /// One file per signal type, sample-interleaved, amplifier codes signed.
    FilePerSignalType,
    /// One file per channel, amplifier codes signed.
    FilePerChannel,
}

type Sink = BufWriter<Box<dyn Write + Send>>;

/// Opens the destination behind each session file.
pub(crate) type FileOpener = fn(&Path) -> io::Result<Box<dyn Write + Send>>;

fn open_file(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(File::create(path)?))
}

fn create(opener: FileOpener, path: &Path) -> DaqResult<Sink> {
    opener(path)
        .map(BufWriter::new)
        .map_err(|source| DaqError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn create_if(opener: FileOpener, wanted: bool, path: PathBuf) -> DaqResult<Option<Sink>> {
    if wanted {
        create(opener, &path).map(Some)
    } else {
        Ok(None)
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn signed(code: u16) -> i16 {
    (code as i32 - 32768) as i16
}

/// Open files of one session.
enum FormatWriter {
    SingleFile {
        out: Sink,
    },
    PerSignalType {
        time: Sink,
        amplifier: Option<Sink>,
        aux_input: Option<Sink>,
        supply: Option<Sink>,
        board_adc: Option<Sink>,
        digital_in: Option<Sink>,
        digital_out: Option<Sink>,
    },
    PerChannel {
        time: Sink,
        amplifier: Vec<Sink>,
        aux_input: Vec<Sink>,
        supply: Vec<Sink>,
        board_adc: Vec<Sink>,
        digital_in: Vec<Sink>,
        digital_out: Vec<Sink>,
    },
}

impl FormatWriter {
    fn sinks(&mut self) -> Vec<&mut Sink> {
        match self {
            FormatWriter::SingleFile { out } => vec![out],
            FormatWriter::PerSignalType {
                time,
                amplifier,
                aux_input,
                supply,
                board_adc,
                digital_in,
                digital_out,
            } => std::iter::once(time)
                .chain(
                    [amplifier, aux_input, supply, board_adc, digital_in, digital_out]
                        .into_iter()
                        .filter_map(Option::as_mut),
                )
                .collect(),
            FormatWriter::PerChannel {
                time,
                amplifier,
                aux_input,
                supply,
                board_adc,
                digital_in,
                digital_out,
            } => std::iter::once(time)
                .chain(amplifier.iter_mut())
                .chain(aux_input.iter_mut())
                .chain(supply.iter_mut())
                .chain(board_adc.iter_mut())
                .chain(digital_in.iter_mut())
                .chain(digital_out.iter_mut())
                .collect(),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in self.sinks() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Fill `buf` with `fill` and append it to `sink`; returns the byte count.
fn emit(sink: &mut Sink, buf: &mut Vec<u8>, fill: impl FnOnce(&mut Vec<u8>)) -> io::Result<usize> {
    buf.clear();
    fill(buf);
    sink.write_all(buf)?;
    Ok(buf.len())
}

/// Appends sample blocks to disk in the session's [`SaveFormat`].
pub struct RecordingSerializer {
    format: SaveFormat,
    output_dir: PathBuf,
    base_name: String,
    save_temperature: bool,
    save_ttl_out: bool,
    lists: SaveLists,
    header: Option<SessionHeader>,
    timestamp_offset: u32,
    writer: Option<FormatWriter>,
    location: Option<PathBuf>,
    scratch: Vec<u8>,
    opener: FileOpener,
}

impl RecordingSerializer {
    pub fn new(
        format: SaveFormat,
        output_dir: impl Into<PathBuf>,
        base_name: impl Into<String>,
        save_temperature: bool,
        save_ttl_out: bool,
    ) -> Self {
        Self {
            format,
            output_dir: output_dir.into(),
            base_name: base_name.into(),
            save_temperature,
            save_ttl_out,
            lists: SaveLists::default(),
            header: None,
            timestamp_offset: 0,
            writer: None,
            location: None,
            scratch: Vec::new(),
            opener: open_file,
        }
    }

    /// Route session files through `opener` instead of the filesystem.
    #[cfg(test)]
    pub(crate) fn with_opener(mut self, opener: FileOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn format(&self) -> SaveFormat {
        self.format
    }

    pub fn save_temperature(&self) -> bool {
        self.save_temperature
    }

    pub fn save_ttl_out(&self) -> bool {
        self.save_ttl_out
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// The `.rhd` file or session directory currently being written.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn bytes_per_block(&self) -> usize {
        self.lists
            .bytes_per_block(self.format, self.save_temperature, self.save_ttl_out)
    }

    /// Open the first file of a session; timestamps are written relative to `timestamp_offset`.
    pub fn begin_session(
        &mut self,
        lists: SaveLists,
        header: SessionHeader,
        timestamp_offset: u32,
    ) -> DaqResult<PathBuf> {
        if self.is_open() {
            self.end_session()?;
        }
        self.lists = lists;
        self.header = Some(header);
        self.timestamp_offset = timestamp_offset;
        self.open()
    }

    /// Close the current file and continue the session in a freshly named one.
    pub fn rotate(&mut self) -> DaqResult<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.open()
    }

    /// Flush and close every file of the session.
    pub fn end_session(&mut self) -> DaqResult<()> {
        let location = self.location.take();
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if let Some(path) = location {
                info!("Closed {}", path.display());
            }
        }
        Ok(())
    }

    fn open(&mut self) -> DaqResult<PathBuf> {
        let header = self.header.as_ref().ok_or_else(|| {
            DaqError::Io(io::Error::other("session header missing"))
        })?;
        fs::create_dir_all(&self.output_dir).map_err(|source| DaqError::Open {
            path: self.output_dir.clone(),
            source,
        })?;
        let stem = timestamped_stem(&self.base_name);
        let lists = &self.lists;
        let opener = self.opener;

        let (location, writer) = match self.format {
            SaveFormat::Intan => {
                let path = unique_path(&self.output_dir, &stem, ".rhd");
                let mut out = create(opener, &path)?;
                let sensors = if self.save_temperature {
                    lists.temp_sensors.len()
                } else {
                    0
                };
                header.write_to(&mut out, sensors)?;
                (path, FormatWriter::SingleFile { out })
            }
            SaveFormat::FilePerSignalType => {
                let dir = session_dir(&self.output_dir, &stem)?;
                write_info(opener, &dir, header)?;
                let optional = |wanted: bool, name: &str| create_if(opener, wanted, dir.join(name));
                let writer = FormatWriter::PerSignalType {
                    time: create(opener, &dir.join("time.dat"))?,
                    amplifier: optional(!lists.amplifier.is_empty(), "amplifier.dat")?,
                    aux_input: optional(!lists.aux_input.is_empty(), "auxiliary.dat")?,
                    supply: optional(!lists.supply_voltage.is_empty(), "supply.dat")?,
                    board_adc: optional(!lists.board_adc.is_empty(), "analogin.dat")?,
                    digital_in: optional(lists.any_digital_in(), "digitalin.dat")?,
                    digital_out: optional(self.save_ttl_out, "digitalout.dat")?,
                };
                (dir, writer)
            }
            SaveFormat::FilePerChannel => {
                let dir = session_dir(&self.output_dir, &stem)?;
                write_info(opener, &dir, header)?;
                let files = |prefix: &str, list: &[crate::ChannelDescriptor]| {
                    list.iter()
                        .map(|c| {
                            let name = format!("{prefix}-{}.dat", c.native_name);
                            create(opener, &dir.join(name))
                        })
                        .collect::<DaqResult<Vec<_>>>()
                };
                let writer = FormatWriter::PerChannel {
                    time: create(opener, &dir.join("time.dat"))?,
                    amplifier: files("amp", &lists.amplifier)?,
                    aux_input: files("aux", &lists.aux_input)?,
                    supply: files("vdd", &lists.supply_voltage)?,
                    board_adc: files("board", &lists.board_adc)?,
                    digital_in: files("board", &lists.board_digital_in)?,
                    digital_out: files("board", &lists.board_digital_out)?,
                };
                (dir, writer)
            }
        };

        info!("Recording to {}", location.display());
        self.writer = Some(writer);
        self.location = Some(location.clone());
        Ok(location)
    }

    /// Append one block; `temperatures` holds the averaged reading of each stream.
    /// Returns the number of bytes written.
    pub fn write_block(&mut self, block: &SampleBlock, temperatures: &[f64]) -> DaqResult<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Io(io::Error::other("no recording session is open")))?;
        let lists = &self.lists;
        let buf = &mut self.scratch;
        let offset = self.timestamp_offset;
        let save_temperature = self.save_temperature;
        let save_ttl_out = self.save_ttl_out;
        let n = SAMPLES_PER_BLOCK;

        let timestamps = |buf: &mut Vec<u8>| {
            for &ts in block.timestamp.iter() {
                buf.extend_from_slice(&(ts.wrapping_sub(offset) as i32).to_le_bytes());
            }
        };

        let written = match writer {
            FormatWriter::SingleFile { out } => emit(out, buf, |buf| {
                timestamps(buf);
                for c in &lists.amplifier {
                    for t in 0..n {
                        put_u16(buf, block.amplifier[[c.board_stream, c.chip_channel, t]]);
                    }
                }
                for c in &lists.aux_input {
                    for k in 0..n / 4 {
                        put_u16(buf, block.aux_input(c.board_stream, c.chip_channel, k));
                    }
                }
                for c in &lists.supply_voltage {
                    put_u16(buf, block.supply_voltage(c.board_stream));
                }
                if save_temperature {
                    for c in &lists.temp_sensors {
                        let celsius = temperatures.get(c.board_stream).copied().unwrap_or(0.0);
                        put_i16(buf, (100.0 * celsius) as i16);
                    }
                }
                for c in &lists.board_adc {
                    for t in 0..n {
                        put_u16(buf, block.board_adc[[c.chip_channel, t]]);
                    }
                }
                if lists.any_digital_in() {
                    block.ttl_in.iter().for_each(|&w| put_u16(buf, w));
                }
                if save_ttl_out {
                    block.ttl_out.iter().for_each(|&w| put_u16(buf, w));
                }
            })?,
            FormatWriter::PerSignalType {
                time,
                amplifier,
                aux_input,
                supply,
                board_adc,
                digital_in,
                digital_out,
            } => {
                let mut total = emit(time, buf, timestamps)?;
                if let Some(sink) = amplifier {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            for c in &lists.amplifier {
                                let code = block.amplifier[[c.board_stream, c.chip_channel, t]];
                                put_i16(buf, signed(code));
                            }
                        }
                    })?;
                }
                if let Some(sink) = aux_input {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            for c in &lists.aux_input {
                                let code = block.aux_input_held(c.board_stream, c.chip_channel, t);
                                put_u16(buf, code);
                            }
                        }
                    })?;
                }
                if let Some(sink) = supply {
                    total += emit(sink, buf, |buf| {
                        for _ in 0..n {
                            for c in &lists.supply_voltage {
                                put_u16(buf, block.supply_voltage(c.board_stream));
                            }
                        }
                    })?;
                }
                if let Some(sink) = board_adc {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            for c in &lists.board_adc {
                                put_u16(buf, block.board_adc[[c.chip_channel, t]]);
                            }
                        }
                    })?;
                }
                if let Some(sink) = digital_in {
                    total += emit(sink, buf, |buf| {
                        block.ttl_in.iter().for_each(|&w| put_u16(buf, w))
                    })?;
                }
                if let Some(sink) = digital_out {
                    total += emit(sink, buf, |buf| {
                        block.ttl_out.iter().for_each(|&w| put_u16(buf, w))
                    })?;
                }
                total
            }
            FormatWriter::PerChannel {
                time,
                amplifier,
                aux_input,
                supply,
                board_adc,
                digital_in,
                digital_out,
            } => {
                let mut total = emit(time, buf, timestamps)?;
                for (sink, c) in amplifier.iter_mut().zip(&lists.amplifier) {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            let code = block.amplifier[[c.board_stream, c.chip_channel, t]];
                            put_i16(buf, signed(code));
                        }
                    })?;
                }
                for (sink, c) in aux_input.iter_mut().zip(&lists.aux_input) {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            put_u16(buf, block.aux_input_held(c.board_stream, c.chip_channel, t));
                        }
                    })?;
                }
                for (sink, c) in supply.iter_mut().zip(&lists.supply_voltage) {
                    total += emit(sink, buf, |buf| {
                        let code = block.supply_voltage(c.board_stream);
                        (0..n).for_each(|_| put_u16(buf, code));
                    })?;
                }
                for (sink, c) in board_adc.iter_mut().zip(&lists.board_adc) {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            put_u16(buf, block.board_adc[[c.chip_channel, t]]);
                        }
                    })?;
                }
                for (sink, c) in digital_in.iter_mut().zip(&lists.board_digital_in) {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            put_u16(buf, block.digital_in(c.chip_channel, t) as u16);
                        }
                    })?;
                }
                for (sink, c) in digital_out.iter_mut().zip(&lists.board_digital_out) {
                    total += emit(sink, buf, |buf| {
                        for t in 0..n {
                            put_u16(buf, block.digital_out(c.chip_channel, t) as u16);
                        }
                    })?;
                }
                total
            }
        };
        Ok(written)
    }
}

fn session_dir(output_dir: &Path, stem: &str) -> DaqResult<PathBuf> {
    let dir = unique_path(output_dir, stem, "");
    fs::create_dir_all(&dir).map_err(|source| DaqError::Open {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

fn write_info(opener: FileOpener, dir: &Path, header: &SessionHeader) -> DaqResult<()> {
    let mut info = create(opener, &dir.join("info.rhd"))?;
    header.write_to(&mut info, 0)?;
    info.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelCatalog;
    use tempfile::tempdir;

    /// Two amplifiers, one aux input, supply, ADC-01 and DIN-02 on one stream.
    fn small_catalog() -> ChannelCatalog {
        let mut catalog = ChannelCatalog::standard(1);
        for channel in catalog.channels_mut() {
            channel.enabled = matches!(
                channel.native_name.as_str(),
                "A-000" | "A-001" | "A-AUX2" | "A-VDD1" | "ADC-01" | "DIN-02"
            );
        }
        catalog
    }

    fn block() -> SampleBlock {
        let mut block = SampleBlock::new(1);
        for t in 0..SAMPLES_PER_BLOCK {
            block.timestamp[t] = 100 + t as u32;
            block.amplifier[[0, 0, t]] = 32768 + t as u16;
            block.amplifier[[0, 1, t]] = 32000;
            block.auxiliary[[0, 1, t]] = 1000 + t as u16;
            block.board_adc[[1, t]] = 500 + t as u16;
            block.ttl_in[t] = if t % 2 == 0 { 0b100 } else { 0b001 };
            block.ttl_out[t] = 0x8001;
        }
        block
    }

    fn u16_at(bytes: &[u8], i: usize) -> u16 {
        u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]])
    }

    fn i16_at(bytes: &[u8], i: usize) -> i16 {
        i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]])
    }

    fn i32_at(bytes: &[u8], i: usize) -> i32 {
        i32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap())
    }

    fn header(catalog: &ChannelCatalog) -> SessionHeader {
        SessionHeader::new(20000.0, catalog.clone())
    }

    #[test]
    fn single_file_layout_is_block_grouped() {
        let catalog = small_catalog();
        let lists = catalog.save_lists(None, true);
        let dir = tempdir().unwrap();
        let mut ser = RecordingSerializer::new(SaveFormat::Intan, dir.path(), "rec", true, true);
        let path = ser.begin_session(lists, header(&catalog), 100).unwrap();
        let written = ser.write_block(&block(), &[36.789]).unwrap();
        assert_eq!(written, ser.bytes_per_block());
        ser.end_session().unwrap();
        assert!(!ser.is_open());

        let mut expected_header = Vec::new();
        let header_len = header(&catalog).write_to(&mut expected_header, 1).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..header_len], &expected_header[..]);
        let body = &bytes[header_len..];
        assert_eq!(body.len(), written);

        assert_eq!(i32_at(body, 0), 0);
        assert_eq!(i32_at(body, 59), 59);
        let words = &body[240..];
        // amplifier A-000 raw unsigned, then A-001
        assert_eq!(u16_at(words, 0), 32768);
        assert_eq!(u16_at(words, 5), 32773);
        assert_eq!(u16_at(words, 60), 32000);
        // A-AUX2: slot 1 word 4k+2
        assert_eq!(u16_at(words, 120), 1002);
        assert_eq!(u16_at(words, 121), 1006);
        // supply, then temperature as hundredths
        assert_eq!(u16_at(words, 135), 1028);
        assert_eq!(i16_at(words, 136), 3678);
        // ADC-01
        assert_eq!(u16_at(words, 137), 500);
        // digital in word, digital out word
        assert_eq!(u16_at(words, 197), 0b100);
        assert_eq!(u16_at(words, 198), 0b001);
        assert_eq!(u16_at(words, 257), 0x8001);
        assert_eq!(words.len(), 2 * 317);
    }

    #[test]
    fn per_signal_type_layout_is_sample_interleaved() {
        let catalog = small_catalog();
        let lists = catalog.save_lists(None, false);
        let dir = tempdir().unwrap();
        let mut ser =
            RecordingSerializer::new(SaveFormat::FilePerSignalType, dir.path(), "rec", true, false);
        let session = ser.begin_session(lists, header(&catalog), 0).unwrap();
        let written = ser.write_block(&block(), &[30.0]).unwrap();
        assert_eq!(written, ser.bytes_per_block());
        ser.end_session().unwrap();

        assert!(session.join("info.rhd").exists());
        assert!(!session.join("digitalout.dat").exists());
        let time = fs::read(session.join("time.dat")).unwrap();
        assert_eq!(i32_at(&time, 0), 100);

        let amp = fs::read(session.join("amplifier.dat")).unwrap();
        assert_eq!(amp.len(), 2 * 2 * 60);
        // t=3: A-000 then A-001, both signed
        assert_eq!(i16_at(&amp, 6), 3);
        assert_eq!(i16_at(&amp, 7), -768);

        let aux = fs::read(session.join("auxiliary.dat")).unwrap();
        assert_eq!(u16_at(&aux, 0), 1002);
        assert_eq!(u16_at(&aux, 3), 1002);
        assert_eq!(u16_at(&aux, 4), 1006);

        let supply = fs::read(session.join("supply.dat")).unwrap();
        assert_eq!(supply.len(), 120);
        assert!((0..60).all(|t| u16_at(&supply, t) == 1028));

        let adc = fs::read(session.join("analogin.dat")).unwrap();
        assert_eq!(u16_at(&adc, 59), 559);
        let din = fs::read(session.join("digitalin.dat")).unwrap();
        assert_eq!(u16_at(&din, 1), 0b001);
    }

    #[test]
    fn per_channel_layout_upsamples_slow_signals() {
        let catalog = small_catalog();
        let lists = catalog.save_lists(None, true);
        let dir = tempdir().unwrap();
        let mut ser =
            RecordingSerializer::new(SaveFormat::FilePerChannel, dir.path(), "rec", false, true);
        let session = ser.begin_session(lists, header(&catalog), 0).unwrap();
        let written = ser.write_block(&block(), &[]).unwrap();
        assert_eq!(written, ser.bytes_per_block());
        ser.end_session().unwrap();

        let amp = fs::read(session.join("amp-A-000.dat")).unwrap();
        assert_eq!(amp.len(), 120);
        assert_eq!(i16_at(&amp, 0), 0);
        assert_eq!(i16_at(&amp, 59), 59);

        let aux = fs::read(session.join("aux-A-AUX2.dat")).unwrap();
        assert_eq!(aux.len(), 120);
        assert!((0..4).all(|t| u16_at(&aux, t) == 1002));
        assert_eq!(u16_at(&aux, 59), 1058);

        let vdd = fs::read(session.join("vdd-A-VDD1.dat")).unwrap();
        assert!((0..60).all(|t| u16_at(&vdd, t) == 1028));

        let din = fs::read(session.join("board-DIN-02.dat")).unwrap();
        assert_eq!(u16_at(&din, 0), 1);
        assert_eq!(u16_at(&din, 1), 0);

        let dout0 = fs::read(session.join("board-DOUT-00.dat")).unwrap();
        let dout1 = fs::read(session.join("board-DOUT-01.dat")).unwrap();
        assert_eq!(u16_at(&dout0, 0), 1);
        assert_eq!(u16_at(&dout1, 0), 0);
    }

    #[test]
    fn amplifier_sign_differs_between_layouts() {
        let mut catalog = ChannelCatalog::standard(1);
        for channel in catalog.channels_mut() {
            channel.enabled = channel.native_name == "A-000";
        }
        let mut b = SampleBlock::new(1);
        b.amplifier[[0, 0, 0]] = 32768 + 5;
        b.amplifier[[0, 0, 1]] = 32768 - 5;

        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let mut single = RecordingSerializer::new(SaveFormat::Intan, a, "r", false, false);
        let path = single
            .begin_session(catalog.save_lists(None, false), header(&catalog), 0)
            .unwrap();
        single.write_block(&b, &[]).unwrap();
        single.end_session().unwrap();
        let bytes = fs::read(path).unwrap();
        let amp = &bytes[bytes.len() - 120..];
        assert_eq!(u16_at(amp, 0), 32773);
        assert_eq!(u16_at(amp, 1), 32763);

        let b_dir = dir.path().join("b");
        let mut split =
            RecordingSerializer::new(SaveFormat::FilePerChannel, b_dir, "r", false, false);
        let session = split
            .begin_session(catalog.save_lists(None, false), header(&catalog), 0)
            .unwrap();
        split.write_block(&b, &[]).unwrap();
        split.end_session().unwrap();
        let amp = fs::read(session.join("amp-A-000.dat")).unwrap();
        assert_eq!(i16_at(&amp, 0), 5);
        assert_eq!(i16_at(&amp, 1), -5);
    }

    #[test]
    fn rotation_opens_a_new_file_with_header() {
        let catalog = small_catalog();
        let dir = tempdir().unwrap();
        let mut ser = RecordingSerializer::new(SaveFormat::Intan, dir.path(), "rec", false, false);
        let first = ser
            .begin_session(catalog.save_lists(None, false), header(&catalog), 0)
            .unwrap();
        let per_block = ser.write_block(&block(), &[]).unwrap();
        let second = ser.rotate().unwrap();
        ser.write_block(&block(), &[]).unwrap();
        ser.write_block(&block(), &[]).unwrap();
        ser.end_session().unwrap();

        assert_ne!(first, second);
        let a = fs::read(&first).unwrap();
        let b = fs::read(&second).unwrap();
        assert_eq!(&a[..4], &b[..4]);
        assert_eq!(b.len() - a.len(), per_block);
    }

    #[test]
    fn unopenable_destination_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let catalog = small_catalog();
        let sub = blocker.join("sub");
        let mut ser = RecordingSerializer::new(SaveFormat::Intan, sub, "r", false, false);
        let err = ser
            .begin_session(catalog.save_lists(None, false), header(&catalog), 0)
            .unwrap_err();
        assert!(matches!(err, DaqError::Open { .. }));
        assert!(!ser.is_open());
        assert!(ser.write_block(&block(), &[]).is_err());
    }
}
