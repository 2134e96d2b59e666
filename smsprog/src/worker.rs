//! Background execution of long operations.
//!
//! Reading or programming a cartridge takes tens of seconds and a chip erase
//! blocks on a single exchange for as long as the device needs. A [`Worker`]
//! runs one such operation on its own thread, owning the session (or
//! updater) for the duration, and reports progress and completion as
//! [`WorkerEvent`]s. Joining the worker hands the session back.

use {
    crate::{
        cancel::CancelToken,
        error::{Error, Result},
        firmware::{FirmwareUpdater, FlashTool, UpdateState},
        port::Port,
        protocol::exchange::ExchangeOutcome,
        session::Session,
        transfer::Direction,
        workflow::{BlankStatus, CartridgeInfo, VerifyOutcome},
    },
    log::debug,
    std::{
        fmt, io,
        path::PathBuf,
        sync::mpsc::{self, Receiver, Sender},
        thread::{self, JoinHandle},
    },
};

const THREAD_NAME: &str = "smsprog-worker";

/// Cartridge operation run by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Identify the cartridge.
    Info,
    /// Read the whole cartridge.
    ReadRom,
    /// Program an image.
    Program {
        /// Image to write.
        data: Vec<u8>,
        /// Erase the chip first.
        erase: bool,
        /// Read back and compare afterwards.
        verify: bool,
    },
    /// Erase the chip.
    ChipErase,
    /// Check whether the cartridge is blank.
    BlankCheck,
    /// Compare the cartridge with an image.
    Verify {
        /// Expected contents.
        expected: Vec<u8>,
    },
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::ReadRom => f.write_str("read"),
            Self::Program {
                data,
                erase,
                verify,
            } => write!(
                f,
                "program ({} bytes, erase: {erase}, verify: {verify})",
                data.len()
            ),
            Self::ChipErase => f.write_str("erase"),
            Self::BlankCheck => f.write_str("blank check"),
            Self::Verify { expected } => write!(f, "verify ({} bytes)", expected.len()),
        }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    /// Cartridge information.
    Info(CartridgeInfo),
    /// Cartridge contents.
    Rom(Vec<u8>),
    /// The operation completed.
    Done,
    /// Blank check result.
    Blank(BlankStatus),
    /// Verify result.
    Verified(VerifyOutcome),
    /// The programmer firmware was updated.
    FirmwareUpdated,
}

impl Job {
    /// Run the job on the calling thread.
    pub fn run<P: Port>(self, session: &mut Session<P>) -> Result<JobOutput> {
        match self {
            Self::Info => session
                .cartridge_info()
                .map(JobOutput::Info),
            Self::ReadRom => session
                .read_rom()
                .map(JobOutput::Rom),
            Self::Program { data, erase, verify } => {
                if erase {
                    session.erase_and_program(&data)?;
                } else {
                    session.program(&data)?;
                }
                if verify {
                    session
                        .verify_cartridge(&data)
                        .map(JobOutput::Verified)
                } else {
                    Ok(JobOutput::Done)
                }
            },
            Self::ChipErase => session
                .chip_erase()
                .map(|()| JobOutput::Done),
            Self::BlankCheck => session
                .blank_status()
                .map(JobOutput::Blank),
            Self::Verify { expected } => session
                .verify_cartridge(&expected)
                .map(JobOutput::Verified),
        }
    }
}

/// Message from a running worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Transfer progress.
    Progress {
        /// Transfer direction.
        direction: Direction,
        /// Cumulative bytes.
        bytes: usize,
    },
    /// Firmware update state change.
    State(UpdateState),
    /// The operation ended; always the last event.
    Finished(Result<JobOutput>),
}

/// Handle to an operation running on its own thread.
pub struct Worker<T> {
    events: Receiver<WorkerEvent>,
    cancel: Option<CancelToken>,
    handle: JoinHandle<T>,
}

impl<T> Worker<T> {
    /// Events sent by the worker.
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Ask the operation to stop; returns `false` if it cannot be cancelled.
    pub fn cancel(&self) -> bool {
        match self.cancel {
            Some(ref token) => {
                token.cancel();
                true
            },
            None => false,
        }
    }

    /// Whether the thread has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and take back what it owned.
    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| Error::Io(io::Error::other("worker thread panicked")))
    }
}

/// Run `job` on a worker thread.
///
/// Progress reported while the job runs replaces any callback set on the
/// session; the session comes back without one.
pub fn spawn_job<P>(mut session: Session<P>, job: Job) -> Result<Worker<Session<P>>>
where
    P: Port + 'static,
{
    let (tx, events) = mpsc::channel();
    let cancel = session.cancel_token().clone();

    let handle = thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || {
            let progress_tx = tx.clone();
            session.set_progress(move |direction, bytes| {
                let _ = progress_tx.send(WorkerEvent::Progress { direction, bytes });
            });
            debug!("Worker running {job}");
            let result = job.run(&mut session);
            session.clear_progress();
            finish(&tx, result);
            session
        })?;

    Ok(Worker {
        events,
        cancel: Some(cancel),
        handle,
    })
}

/// Run a firmware update on a worker thread.
///
/// State changes are sent as [`WorkerEvent::State`]. The update cannot be
/// cancelled once started.
pub fn spawn_update<T, F>(
    updater: FirmwareUpdater<T>,
    image: PathBuf,
    enter_bootloader: F,
) -> Result<Worker<FirmwareUpdater<T>>>
where
    T: FlashTool + Send + 'static,
    F: FnOnce() -> Result<ExchangeOutcome> + Send + 'static,
{
    let (tx, events) = mpsc::channel();
    let state_tx = tx.clone();
    let mut updater = updater.with_observer(move |state| {
        let _ = state_tx.send(WorkerEvent::State(state));
    });

    let handle = thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || {
            let result = updater
                .run(&image, enter_bootloader)
                .map(|()| JobOutput::FirmwareUpdated);
            finish(&tx, result);
            updater
        })?;

    Ok(Worker {
        events,
        cancel: None,
        handle,
    })
}

fn finish(tx: &Sender<WorkerEvent>, result: Result<JobOutput>) {
    if tx.send(WorkerEvent::Finished(result)).is_err() {
        debug!("Worker result dropped, nobody is listening");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        firmware::{ToolOutput, UpdateConfig},
        testing::{FakeCartridge, INIT_FLASH, INIT_ROM},
    };
    use std::time::Duration;

    fn wait(worker: &Worker<impl Sized>) -> (Vec<WorkerEvent>, Result<JobOutput>) {
        let mut events = Vec::new();
        loop {
            match worker
                .events()
                .recv_timeout(Duration::from_secs(10))
                .unwrap()
            {
                WorkerEvent::Finished(result) => return (events, result),
                other => events.push(other),
            }
        }
    }

    #[test]
    fn test_job_summary_omits_image_contents() {
        let job = Job::Program {
            data: vec![0xA5; 4096],
            erase: true,
            verify: false,
        };
        assert_eq!(
            job.to_string(),
            "program (4096 bytes, erase: true, verify: false)"
        );
        assert_eq!(
            Job::Verify {
                expected: vec![0; 32]
            }
            .to_string(),
            "verify (32 bytes)"
        );
        assert_eq!(Job::ReadRom.to_string(), "read");
    }

    #[test]
    fn test_read_job_reports_progress_and_returns_session() {
        let rom: Vec<u8> = (0..16 * 1024).map(|i| (i * 7) as u8).collect();
        let cart = FakeCartridge::new(INIT_ROM, rom.clone());
        let worker = spawn_job(Session::new(cart.port()), Job::ReadRom).unwrap();

        let (events, result) = wait(&worker);

        assert_eq!(result.unwrap(), JobOutput::Rom(rom));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Progress {
                direction: Direction::Download,
                ..
            }
        )));
        let session = worker.join().unwrap();
        // A single `init` sizes and starts the read
        assert_eq!(session.into_port().commands(), ["", "", "init", "dx", ""]);
    }

    #[test]
    fn test_program_job_with_verify() {
        let cart = FakeCartridge::new(INIT_FLASH, vec![0u8; 512]).with_version("1.3");
        let data = vec![0x5A; 512];
        let job = Job::Program {
            data: data.clone(),
            erase: true,
            verify: true,
        };
        let worker = spawn_job(Session::new(cart.port()), job).unwrap();

        let (_, result) = wait(&worker);

        assert_eq!(result.unwrap(), JobOutput::Verified(VerifyOutcome::Match));
        worker.join().unwrap();
        assert_eq!(*cart.memory.lock().unwrap(), data);
    }

    #[test]
    fn test_job_error_is_delivered() {
        let cart = FakeCartridge::new(INIT_ROM, vec![0u8; 256]);
        let worker = spawn_job(Session::new(cart.port()), Job::ChipErase).unwrap();

        let (_, result) = wait(&worker);

        assert!(matches!(result, Err(Error::CartridgeType(_))));
        assert!(worker.cancel());
        worker.join().unwrap();
    }

    struct InstantTool;

    impl FlashTool for InstantTool {
        fn run(&mut self, args: &[&str]) -> Result<ToolOutput> {
            let mut output = ToolOutput {
                status: Some(0),
                ..Default::default()
            };
            match args {
                ["--help"] => output.stderr = "[global-options]".into(),
                [_, "get"] => output.stdout = "Bootloader Version: 0x00 (0)".into(),
                _ => {},
            }
            Ok(output)
        }
    }

    #[test]
    fn test_update_reports_states() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let updater = FirmwareUpdater::new(InstantTool).with_config(UpdateConfig {
            poll_interval: Duration::ZERO,
            start_settle: Duration::ZERO,
            ..Default::default()
        });
        let worker = spawn_update(updater, image.path().to_path_buf(), || {
            Ok(ExchangeOutcome::Disconnected)
        })
        .unwrap();

        let (events, result) = wait(&worker);

        assert_eq!(result.unwrap(), JobOutput::FirmwareUpdated);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::State(UpdateState::Done))
        ));
        assert!(!worker.cancel());
        assert_eq!(worker.join().unwrap().state(), UpdateState::Done);
    }
}
