use crate::{
    AcquisitionController, AcquisitionState, Conf, Counter, DaqError, DrainReport, FileEvent,
    SyntheticBoard, TriggerSettings,
};
use anyhow::{anyhow, Result};
use crossbeam_channel::{tick, unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{error, info, warn};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Operator requests forwarded to the acquisition thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Record,
    ArmTrigger,
    StopRecording,
}

/// Messages from the acquisition thread to the status view.
#[derive(Debug)]
pub enum Update {
    Drain(DrainReport),
    Fault {
        state: AcquisitionState,
        message: String,
    },
}

#[derive(Debug)]
pub struct Status {
    pub counter: Counter,
    pub state: AcquisitionState,
    pub file: Option<PathBuf>,
    pub fifo_percent: f64,
    pub latency_ms: f64,
    pub last_error: Option<String>,
    pub config: Conf,
    pub exit: bool,
}

impl Status {
    pub fn new(config: Conf) -> Self {
        Self {
            counter: Counter::default(),
            state: AcquisitionState::Idle,
            file: None,
            fifo_percent: 0.0,
            latency_ms: 0.0,
            last_error: None,
            config,
            exit: false,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let ticker = tick(Duration::from_millis(250));
        let controller = self
            .config
            .build_controller(self.config.synthetic_board()?)?;
        let trigger = self.config.trigger_settings()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx_stats, rx_stats) = unbounded();
        let (tx_commands, rx_commands) = unbounded();
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = thread::spawn(move || -> Result<()> {
            acquisition_thread(controller, trigger, rx_commands, tx_stats, shutdown_clone)
        });
        self.counter.reset();

        while !self.exit {
            let _ = ticker.recv();

            while let Ok(update) = rx_stats.try_recv() {
                self.apply(update);
            }

            self.handle_events(&tx_commands)?;
            terminal.draw(|f| self.draw(f))?;
        }

        shutdown.store(true, Ordering::SeqCst);
        drop(tx_commands);
        handle
            .join()
            .map_err(|_| anyhow!("acquisition thread panicked"))?
    }

    /// Fold one acquisition update into the displayed state.
    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Drain(report) => {
                self.counter.increment(report.blocks, report.bytes_written);
                self.state = report.state;
                self.fifo_percent = report.fifo_percent;
                self.latency_ms = report.latency_ms;
                for event in report.events {
                    match event {
                        FileEvent::Opened(path) | FileEvent::Rotated(path) => {
                            self.file = Some(path)
                        }
                        FileEvent::Closed(_) => self.file = None,
                    }
                }
            }
            Update::Fault { state, message } => {
                self.state = state;
                if !state.is_recording() {
                    self.file = None;
                }
                self.last_error = Some(message);
            }
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self, commands: &Sender<Command>) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    if let Some(command) = self.handle_key_event(key_event) {
                        if commands.send(command).is_err() {
                            self.last_error = Some("acquisition has stopped".to_string());
                        }
                    }
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) -> Option<Command> {
        match key_event.code {
            KeyCode::Char('q') | KeyCode::Char('Q') => {
                self.exit = true;
                None
            }
            KeyCode::Char('r') | KeyCode::Char('R') => Some(Command::Record),
            KeyCode::Char('t') | KeyCode::Char('T') => Some(Command::ArmTrigger),
            KeyCode::Char('s') | KeyCode::Char('S') => Some(Command::StopRecording),
            _ => None,
        }
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let board = &self.config.board;
        let title = Line::from(
            format!(
                " {} stream(s) at {} S/s ",
                board.num_streams, board.sample_rate
            )
            .bold(),
        );
        let instructions = Line::from(vec![
            " Record ".into(),
            "<R>".blue().bold(),
            " Trigger ".into(),
            "<T>".blue().bold(),
            " Stop ".into(),
            "<S>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let file = self
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut lines = vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.counter
                    .t_begin
                    .elapsed()
                    .as_secs()
                    .to_string()
                    .yellow(),
                " s".into(),
                " State: ".into(),
                self.state.label().yellow(),
                " Data rate: ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " MB/s".into(),
                " Average: ".into(),
                format!("{:.2}", self.counter.average_rate()).yellow(),
                " MB/s".into(),
            ]),
            Line::from(vec![
                "FIFO: ".into(),
                format!("{:.1}", self.fifo_percent).yellow(),
                " %".into(),
                " Latency: ".into(),
                format!("{:.1}", self.latency_ms).yellow(),
                " ms".into(),
                " Blocks: ".into(),
                self.counter.n_blocks.to_string().yellow(),
            ]),
            Line::from(vec!["File: ".into(), file.yellow()]),
        ];
        if let Some(message) = &self.last_error {
            lines.push(Line::from(message.clone().red()));
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}

fn execute(
    controller: &mut AcquisitionController<SyntheticBoard>,
    trigger: TriggerSettings,
    command: Command,
) -> Result<(), DaqError> {
    match command {
        Command::Record => controller.start_recording(),
        Command::ArmTrigger => controller.arm_trigger(trigger),
        Command::StopRecording => controller.stop_recording(),
    }
}

/// Owns the controller: applies operator commands and drains the board until shutdown.
fn acquisition_thread(
    mut controller: AcquisitionController<SyntheticBoard>,
    trigger: TriggerSettings,
    rx: Receiver<Command>,
    tx: Sender<Update>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    controller.start()?;
    let fault = |controller: &AcquisitionController<SyntheticBoard>, e: &DaqError| Update::Fault {
        state: controller.state(),
        message: e.to_string(),
    };

    while !shutdown.load(Ordering::SeqCst) {
        while let Ok(command) = rx.try_recv() {
            info!("Operator requested {command:?}");
            if let Err(e) = execute(&mut controller, trigger, command) {
                warn!("{command:?} refused: {e}");
                if tx.send(fault(&controller, &e)).is_err() {
                    break;
                }
            }
        }

        match controller.drain_cycle() {
            Ok(report) => {
                if report.blocks == 0 {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if tx.send(Update::Drain(report)).is_err() {
                    break;
                }
            }
            Err(e @ DaqError::FifoOverflow { .. }) => {
                error!("{e}");
                let _ = tx.send(fault(&controller, &e));
                return Ok(());
            }
            Err(e) => {
                if tx.send(fault(&controller, &e)).is_err() {
                    break;
                }
            }
        }
    }

    controller.stop()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;

    fn status() -> Status {
        Status::new(Conf::builder().load().unwrap())
    }

    fn report(events: Vec<FileEvent>, state: AcquisitionState) -> DrainReport {
        DrainReport {
            blocks: 12,
            bytes_written: 4096,
            fifo_percent: 1.5,
            latency_ms: 36.0,
            state,
            events,
        }
    }

    #[test]
    fn updates_track_the_current_file() {
        let mut status = status();
        status.apply(Update::Drain(report(
            vec![FileEvent::Opened(PathBuf::from("a.rhd"))],
            AcquisitionState::Recording,
        )));
        assert_eq!(status.file, Some(PathBuf::from("a.rhd")));
        assert_eq!(status.counter.n_blocks, 12);
        assert_eq!(status.latency_ms, 36.0);

        status.apply(Update::Drain(report(
            vec![FileEvent::Rotated(PathBuf::from("b.rhd"))],
            AcquisitionState::Recording,
        )));
        assert_eq!(status.file, Some(PathBuf::from("b.rhd")));

        status.apply(Update::Drain(report(
            vec![FileEvent::Closed(PathBuf::from("b.rhd"))],
            AcquisitionState::Running,
        )));
        assert_eq!(status.file, None);
        assert_eq!(status.counter.total_size, 3 * 4096);
    }

    #[test]
    fn faults_are_shown_and_clear_the_file() {
        let mut status = status();
        status.file = Some(PathBuf::from("a.rhd"));
        status.apply(Update::Fault {
            state: AcquisitionState::Running,
            message: "write failed: disk full".to_string(),
        });
        assert_eq!(status.state, AcquisitionState::Running);
        assert_eq!(status.file, None);
        assert_eq!(status.last_error.as_deref(), Some("write failed: disk full"));
    }

    #[test]
    fn view_shows_current_and_average_rates() {
        let mut status = status();
        status.counter.t_begin = std::time::Instant::now() - Duration::from_secs(8);
        let mut drain = report(vec![], AcquisitionState::Recording);
        drain.bytes_written = 16 * 1024 * 1024;
        status.apply(Update::Drain(drain));

        let area = Rect::new(0, 0, 100, 8);
        let mut buf = Buffer::empty(area);
        status.render(area, &mut buf);
        let text: String = buf.content().iter().map(|cell| cell.symbol()).collect();
        assert!(text.contains("Data rate: 16.00 MB/s"), "{text}");
        assert!(text.contains("Average: 2.00 MB/s"), "{text}");
        assert!(text.contains("Blocks: 12"), "{text}");
    }

    #[test]
    fn keys_map_to_commands() {
        let mut status = status();
        let key = |c| KeyEvent::from(KeyCode::Char(c));
        assert_eq!(status.handle_key_event(key('r')), Some(Command::Record));
        assert_eq!(status.handle_key_event(key('T')), Some(Command::ArmTrigger));
        assert_eq!(status.handle_key_event(key('s')), Some(Command::StopRecording));
        assert!(!status.exit);
        assert_eq!(status.handle_key_event(key('q')), None);
        assert!(status.exit);
    }

    #[test]
    fn commands_drive_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = Conf::builder().load().unwrap();
        conf.recording.output_dir = dir.path().to_path_buf();
        let mut controller = conf
            .build_controller(conf.synthetic_board().unwrap())
            .unwrap();
        let trigger = conf.trigger_settings().unwrap();

        execute(&mut controller, trigger, Command::ArmTrigger).unwrap();
        assert_eq!(controller.state(), AcquisitionState::ArmedForTrigger);
        assert!(matches!(
            execute(&mut controller, trigger, Command::Record),
            Err(DaqError::InvalidState { .. })
        ));
        execute(&mut controller, trigger, Command::StopRecording).unwrap();
        assert_eq!(controller.state(), AcquisitionState::Running);

        execute(&mut controller, trigger, Command::Record).unwrap();
        assert!(controller.state().is_recording());
        assert!(controller.recording_location().is_some());
        controller.stop().unwrap();
    }
}
