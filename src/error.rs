use crate::AcquisitionState;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("FIFO {percent:.1}% full for {polls} consecutive polls; acquisition halted")]
    FifoOverflow { percent: f64, polls: usize },
    #[error("cannot open {} for writing: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid trigger channel {0}; expected 0-15 (digital in) or 16-23 (board ADC)")]
    InvalidTriggerChannel(u8),
    #[error("invalid trigger window: {0}")]
    InvalidTriggerWindow(String),
    #[error("impedance test frequency {frequency} Hz is not usable at {sample_rate} S/s")]
    InvalidImpedanceFrequency { frequency: f64, sample_rate: f64 },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: AcquisitionState,
    },
    #[error("malformed USB frame: {0}")]
    Frame(String),
    #[error("{count} blocks exceed scratch capacity of {capacity}")]
    ScratchOverflow { count: usize, capacity: usize },
    #[error("board driver: {0}")]
    Board(String),
}

pub type DaqResult<T> = Result<T, DaqError>;
