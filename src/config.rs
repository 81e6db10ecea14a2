use crate::{
    AcquisitionController, BoardDriver, ChannelCatalog, DaqError, DaqResult, FilterEngine,
    ImpedancePlan, ImpedanceSettings, RecordingSerializer, SaveFormat, SessionHeader,
    SyntheticBoard, TriggerPolarity, TriggerSettings, MAX_BLOCKS, MAX_STREAMS,
};
use confique::Config;
use std::path::PathBuf;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub board: BoardConf,
    #[config(nested)]
    pub filter: FilterConf,
    #[config(nested)]
    pub recording: RecordingConf,
    #[config(nested)]
    pub channels: ChannelsConf,
    #[config(nested)]
    pub trigger: TriggerConf,
    #[config(nested)]
    pub impedance: ImpedanceConf,
}

#[derive(Config, Debug, Clone)]
pub struct BoardConf {
    #[config(default = 20000.0)]
    pub sample_rate: f64,
    #[config(default = 1)]
    pub num_streams: usize,
    /// Blocks read from the FIFO per drain cycle.
    #[config(default = 12)]
    pub blocks_per_drain: usize,
    #[config(default = 67108864)]
    pub fifo_capacity_words: usize,
}

#[derive(Config, Debug, Clone)]
pub struct FilterConf {
    #[config(default = false)]
    pub notch_enabled: bool,
    #[config(default = 60.0)]
    pub notch_frequency: f64,
    #[config(default = 10.0)]
    pub notch_bandwidth: f64,
    #[config(default = false)]
    pub highpass_enabled: bool,
    #[config(default = 250.0)]
    pub highpass_cutoff: f64,
}

#[derive(Config, Debug, Clone)]
pub struct RecordingConf {
    #[config(default = "data")]
    pub output_dir: PathBuf,
    #[config(default = "recording")]
    pub base_name: String,
    #[config(default = "Intan")]
    pub save_format: SaveFormat,
    /// Single-file recordings start a new file after this many minutes.
    #[config(default = 1.0)]
    pub rotation_minutes: f64,
    #[config(default = false)]
    pub save_temperature: bool,
    #[config(default = false)]
    pub save_ttl_out: bool,
    #[config(default = [])]
    pub notes: Vec<String>,
}

/// Native channel names (`A-000`, `DIN-03`, ...) to switch on or off.
#[derive(Config, Debug, Clone)]
pub struct ChannelsConf {
    #[config(default = [])]
    pub enable: Vec<String>,
    #[config(default = [])]
    pub disable: Vec<String>,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerConf {
    /// 0-15 digital inputs, 16-23 board ADC inputs.
    #[config(default = 0)]
    pub channel: u8,
    #[config(default = "Rising")]
    pub polarity: TriggerPolarity,
    #[config(default = 1.0)]
    pub pre_trigger_seconds: f64,
    #[config(default = 1.0)]
    pub post_trigger_seconds: f64,
    #[config(default = true)]
    pub save_trigger_channel: bool,
}

#[derive(Config, Debug, Clone)]
pub struct ImpedanceConf {
    #[config(default = 1000.0)]
    pub desired_frequency: f64,
    #[config(default = 0.1)]
    pub lower_bandwidth: f64,
    #[config(default = 7500.0)]
    pub upper_bandwidth: f64,
    #[config(default = true)]
    pub dsp_enabled: bool,
    #[config(default = 1.0)]
    pub dsp_cutoff: f64,
}

fn invalid(message: String) -> DaqError {
    DaqError::InvalidSettings(message)
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl Conf {
    /// Reject settings no session could run with.
    pub fn validate(&self) -> DaqResult<()> {
        let board = &self.board;
        if !positive(board.sample_rate) {
            return Err(invalid(format!("sample rate {}", board.sample_rate)));
        }
        if board.num_streams == 0 || board.num_streams > MAX_STREAMS {
            return Err(invalid(format!(
                "{} data streams; 1-{MAX_STREAMS} supported",
                board.num_streams
            )));
        }
        if board.blocks_per_drain == 0 || board.blocks_per_drain > MAX_BLOCKS {
            return Err(invalid(format!(
                "{} blocks per drain; 1-{MAX_BLOCKS} supported",
                board.blocks_per_drain
            )));
        }
        if board.fifo_capacity_words == 0 {
            return Err(invalid("FIFO capacity of 0 words".to_string()));
        }

        let nyquist = board.sample_rate / 2.0;
        let filter = &self.filter;
        if filter.notch_enabled
            && (!positive(filter.notch_frequency)
                || !positive(filter.notch_bandwidth)
                || filter.notch_frequency >= nyquist)
        {
            return Err(invalid(format!(
                "notch at {} Hz with {} Hz bandwidth",
                filter.notch_frequency, filter.notch_bandwidth
            )));
        }
        if filter.highpass_enabled
            && (!positive(filter.highpass_cutoff) || filter.highpass_cutoff >= nyquist)
        {
            return Err(invalid(format!(
                "high-pass cutoff {} Hz",
                filter.highpass_cutoff
            )));
        }

        let recording = &self.recording;
        if !positive(recording.rotation_minutes) {
            return Err(invalid(format!(
                "rotation period of {} minutes",
                recording.rotation_minutes
            )));
        }
        if recording.notes.len() > 3 {
            return Err(invalid(format!(
                "{} notes; at most 3 are stored",
                recording.notes.len()
            )));
        }
        if recording.base_name.is_empty() {
            return Err(invalid("empty recording base name".to_string()));
        }

        self.trigger_settings()?;
        self.catalog()?;
        Ok(())
    }

    pub fn trigger_settings(&self) -> DaqResult<TriggerSettings> {
        let t = &self.trigger;
        TriggerSettings::new(
            t.channel,
            t.polarity,
            t.pre_trigger_seconds,
            t.post_trigger_seconds,
            t.save_trigger_channel,
        )
    }

    pub fn impedance_settings(&self) -> ImpedanceSettings {
        let i = &self.impedance;
        ImpedanceSettings {
            desired_frequency: i.desired_frequency,
            lower_bandwidth: i.lower_bandwidth,
            upper_bandwidth: i.upper_bandwidth,
            dsp_enabled: i.dsp_enabled,
            dsp_cutoff: i.dsp_cutoff,
        }
    }

    /// Standard catalog for the configured streams with `[channels]` applied.
    pub fn catalog(&self) -> DaqResult<ChannelCatalog> {
        let mut catalog = ChannelCatalog::standard(self.board.num_streams);
        let changes = self
            .channels
            .enable
            .iter()
            .map(|name| (name, true))
            .chain(self.channels.disable.iter().map(|name| (name, false)));
        for (name, enabled) in changes {
            if !catalog.set_enabled(name, enabled) {
                return Err(invalid(format!("unknown channel {name}")));
            }
        }
        Ok(catalog)
    }

    pub fn session_header(&self, catalog: ChannelCatalog) -> SessionHeader {
        let mut header = SessionHeader::new(self.board.sample_rate, catalog);
        let i = &self.impedance;
        header.dsp_enabled = i.dsp_enabled;
        header.desired_dsp_cutoff = i.dsp_cutoff;
        header.actual_dsp_cutoff = i.dsp_cutoff;
        header.desired_lower_bandwidth = i.lower_bandwidth;
        header.actual_lower_bandwidth = i.lower_bandwidth;
        header.desired_upper_bandwidth = i.upper_bandwidth;
        header.actual_upper_bandwidth = i.upper_bandwidth;

        header.notch_mode = if !self.filter.notch_enabled {
            0
        } else if (self.filter.notch_frequency - 50.0).abs() < 1e-6 {
            1
        } else if (self.filter.notch_frequency - 60.0).abs() < 1e-6 {
            2
        } else {
            0
        };

        header.desired_impedance_frequency = i.desired_frequency;
        header.actual_impedance_frequency =
            ImpedancePlan::new(&self.impedance_settings(), self.board.sample_rate)
                .map(|plan| plan.frequency)
                .unwrap_or(0.0);

        for (slot, note) in header.notes.iter_mut().zip(&self.recording.notes) {
            slot.clone_from(note);
        }
        header
    }

    pub fn apply_filter(&self, filter: &mut FilterEngine) {
        let f = &self.filter;
        filter.set_notch(
            f.notch_enabled
                .then_some((f.notch_frequency, f.notch_bandwidth)),
        );
        filter.set_highpass(f.highpass_enabled.then_some(f.highpass_cutoff));
    }

    pub fn serializer(&self) -> RecordingSerializer {
        let r = &self.recording;
        RecordingSerializer::new(
            r.save_format,
            r.output_dir.clone(),
            r.base_name.clone(),
            r.save_temperature,
            r.save_ttl_out,
        )
    }

    pub fn synthetic_board(&self) -> DaqResult<SyntheticBoard> {
        SyntheticBoard::new(
            self.board.num_streams,
            self.board.sample_rate,
            self.board.fifo_capacity_words,
        )
    }

    /// Validate and wire a controller around `board`.
    pub fn build_controller<B: BoardDriver>(
        &self,
        board: B,
    ) -> DaqResult<AcquisitionController<B>> {
        self.validate()?;
        if board.num_streams() != self.board.num_streams {
            return Err(invalid(format!(
                "board reports {} streams, configuration expects {}",
                board.num_streams(),
                self.board.num_streams
            )));
        }
        let header = self.session_header(self.catalog()?);
        let mut controller = AcquisitionController::new(
            board,
            self.serializer(),
            header,
            self.board.blocks_per_drain,
            self.recording.rotation_minutes,
        )?;
        self.apply_filter(controller.filter_mut());
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcquisitionState, TriggerSource};
    use std::{fs, path::Path};

    fn load(name: &str, toml: &str) -> Conf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{name}.toml"));
        fs::write(&path, toml).unwrap();
        Conf::builder().file(&path).load().unwrap()
    }

    #[test]
    fn empty_file_takes_defaults() {
        let conf = load("defaults", "");
        assert_eq!(conf.board.sample_rate, 20000.0);
        assert_eq!(conf.board.num_streams, 1);
        assert_eq!(conf.board.blocks_per_drain, 12);
        assert_eq!(conf.board.fifo_capacity_words, 67108864);
        assert_eq!(conf.recording.save_format, SaveFormat::Intan);
        assert_eq!(conf.trigger.polarity, TriggerPolarity::Rising);
        assert!(conf.trigger.save_trigger_channel);
        assert_eq!(conf.impedance_settings(), ImpedanceSettings::default());
        conf.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let conf = load(
            "override",
            r#"
[board]
num_streams = 2
blocks_per_drain = 4

[filter]
notch_enabled = true
notch_frequency = 50.0

[recording]
output_dir = "/tmp/rhd"
save_format = "FilePerChannel"
notes = ["rat 7", "left hemisphere"]

[channels]
enable = ["ADC-00", "DIN-03"]
disable = ["B-031"]

[trigger]
channel = 19
polarity = "Falling"
"#,
        );
        conf.validate().unwrap();
        assert_eq!(conf.recording.save_format, SaveFormat::FilePerChannel);
        assert_eq!(conf.recording.output_dir, Path::new("/tmp/rhd"));

        let trigger = conf.trigger_settings().unwrap();
        assert_eq!(trigger.source, TriggerSource::BoardAdc(3));
        assert_eq!(trigger.polarity, TriggerPolarity::Falling);

        let catalog = conf.catalog().unwrap();
        let enabled = |name: &str| {
            catalog
                .channels()
                .find(|c| c.native_name == name)
                .map(|c| c.enabled)
        };
        assert_eq!(enabled("ADC-00"), Some(true));
        assert_eq!(enabled("DIN-03"), Some(true));
        assert_eq!(enabled("B-031"), Some(false));
        assert_eq!(enabled("B-030"), Some(true));

        let header = conf.session_header(catalog);
        assert_eq!(header.notch_mode, 1);
        assert_eq!(header.notes[0], "rat 7");
        assert_eq!(header.notes[1], "left hemisphere");
        assert_eq!(header.notes[2], "");
        assert_eq!(header.actual_impedance_frequency, 20000.0 / 20.0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            ("streams", "[board]\nnum_streams = 9\n"),
            ("drain", "[board]\nblocks_per_drain = 0\n"),
            ("rotation", "[recording]\nrotation_minutes = 0.0\n"),
            ("notes", "[recording]\nnotes = [\"a\", \"b\", \"c\", \"d\"]\n"),
            ("channel", "[channels]\nenable = [\"Z-000\"]\n"),
            ("window", "[trigger]\npre_trigger_seconds = -1.0\n"),
            (
                "notch",
                "[filter]\nnotch_enabled = true\nnotch_bandwidth = 0.0\n",
            ),
        ];
        for (name, toml) in cases {
            let conf = load(name, toml);
            assert!(
                matches!(
                    conf.validate(),
                    Err(DaqError::InvalidSettings(_)) | Err(DaqError::InvalidTriggerWindow(_))
                ),
                "{name} accepted"
            );
        }
        let conf = load("trigger", "[trigger]\nchannel = 24\n");
        assert!(matches!(
            conf.validate(),
            Err(DaqError::InvalidTriggerChannel(24))
        ));
    }

    #[test]
    fn unusable_impedance_frequency_leaves_actual_at_zero() {
        let conf = load("imp", "[impedance]\ndesired_frequency = 9000.0\n");
        let header = conf.session_header(conf.catalog().unwrap());
        assert_eq!(header.desired_impedance_frequency, 9000.0);
        assert_eq!(header.actual_impedance_frequency, 0.0);
    }

    #[test]
    fn controller_is_built_idle_with_filters_applied() {
        let conf = load(
            "controller",
            "[filter]\nhighpass_enabled = true\n[recording]\nsave_temperature = true\n",
        );
        let board = conf.synthetic_board().unwrap();
        let controller = conf.build_controller(board).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(controller.blocks_per_drain(), 12);
        assert!(controller.serializer().save_temperature());

        let mismatched = SyntheticBoard::new(2, 20000.0, 1 << 20).unwrap();
        assert!(matches!(
            conf.build_controller(mismatched),
            Err(DaqError::InvalidSettings(_))
        ));
    }
}
