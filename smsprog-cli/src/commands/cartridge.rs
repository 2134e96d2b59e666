//! Cartridge read, program, erase, blank check and verify commands.

use {
    super::{byte_counter, byte_progress, info::describe_image},
    crate::{CliError, Settings},
    anyhow::{Context, Result, bail},
    console::style,
    indicatif::ProgressBar,
    smsprog::{
        BlankStatus, Capability, Direction, ExchangeOutcome, Job, JobOutput, NativePort, Session,
        VerifyOutcome, WorkerEvent, spawn_job,
    },
    std::{fs, io, path::Path},
};

/// Run `job` on a worker thread, drawing its transfer progress on `pb`.
fn run_job(
    settings: &Settings,
    session: Session<NativePort>,
    job: Job,
    pb: ProgressBar,
) -> Result<JobOutput> {
    let worker = spawn_job(session, job)?;

    let mut phase = None;
    let result = loop {
        match worker.events().recv() {
            Ok(WorkerEvent::Progress { direction, bytes }) => {
                if phase != Some(direction) {
                    if phase.is_some() {
                        pb.reset();
                    }
                    phase = Some(direction);
                    pb.set_message(match direction {
                        Direction::Download => "Reading",
                        Direction::Upload => "Writing",
                    });
                }
                pb.set_position(bytes as u64);
            },
            Ok(WorkerEvent::State(_)) => {},
            Ok(WorkerEvent::Finished(result)) => break result,
            Err(_) => {
                break Err(smsprog::Error::Io(io::Error::other(
                    "worker stopped without a result",
                )));
            },
        }
    };
    pb.finish_and_clear();
    // Dropping the returned session closes the port
    worker.join()?;

    match result {
        Err(e) if settings.cancel.is_cancelled() && !matches!(e, smsprog::Error::Cancelled) => {
            Err(CliError::Cancelled(format!("Interrupted ({e})")).into())
        },
        other => other.map_err(anyhow::Error::from),
    }
}

fn unexpected(output: &JobOutput) -> anyhow::Error {
    anyhow::anyhow!("unexpected worker result: {output:?}")
}

fn read_image(input: &Path) -> Result<Vec<u8>> {
    let data =
        fs::read(input).with_context(|| format!("Failed to read image {}", input.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", input.display())).into());
    }
    Ok(data)
}

fn report_verify(settings: &Settings, outcome: VerifyOutcome) -> Result<()> {
    match outcome {
        VerifyOutcome::Match => {
            if !settings.quiet {
                eprintln!("{} Verify OK", style("✓").green());
            }
        },
        VerifyOutcome::PrefixMatch { extra } => {
            if !settings.quiet {
                eprintln!(
                    "{} Verify OK ({extra} more bytes read back than the image holds)",
                    style("✓").green()
                );
            }
        },
        VerifyOutcome::Mismatch { offset } => {
            bail!("Verify failed: first difference at offset 0x{offset:05X}")
        },
        VerifyOutcome::TooShort { expected, actual } => {
            bail!("Verify failed: read back {actual} bytes, expected at least {expected}")
        },
    }
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(settings: &Settings, output: &Path) -> Result<()> {
    let session = settings.open_session()?;
    if !settings.quiet {
        eprintln!("{} Reading cartridge...", style("⏳").yellow());
    }

    // The cartridge size is only known once the read job has run `init`
    let pb = byte_counter(settings.quiet);
    let rom = match run_job(settings, session, Job::ReadRom, pb)? {
        JobOutput::Rom(rom) => rom,
        other => return Err(unexpected(&other)),
    };

    fs::write(output, &rom).with_context(|| format!("Failed to write {}", output.display()))?;
    if !settings.quiet {
        eprintln!(
            "{} Read {} bytes into {} ({})",
            style("✓").green(),
            rom.len(),
            style(output.display()).cyan(),
            describe_image(&rom)
        );
    }
    Ok(())
}

/// Program command implementation.
pub(crate) fn cmd_program(
    settings: &Settings,
    input: &Path,
    erase: bool,
    verify: bool,
) -> Result<()> {
    let data = read_image(input)?;
    if !settings.quiet {
        eprintln!(
            "{} {} ({} bytes, {})",
            style("📦").cyan(),
            input.display(),
            data.len(),
            describe_image(&data)
        );
    }

    let session = settings.open_session()?;
    if !settings.quiet && erase {
        eprintln!("{} Erasing and programming...", style("⏳").yellow());
    }
    let total = data.len() as u64;
    let job = Job::Program {
        data,
        erase,
        verify,
    };

    let pb = byte_progress(settings.quiet, total);
    match run_job(settings, session, job, pb).context("Programming failed")? {
        JobOutput::Done => {
            if !settings.quiet {
                eprintln!("{} Programmed {total} bytes", style("✓").green());
            }
            Ok(())
        },
        JobOutput::Verified(outcome) => {
            if !settings.quiet {
                eprintln!("{} Programmed {total} bytes", style("✓").green());
            }
            report_verify(settings, outcome)
        },
        other => Err(unexpected(&other)),
    }
}

/// Erase command implementation.
pub(crate) fn cmd_erase(settings: &Settings) -> Result<()> {
    let session = settings.open_session()?;
    if !settings.quiet {
        eprintln!("{} Erasing...", style("⏳").yellow());
    }

    match run_job(settings, session, Job::ChipErase, ProgressBar::hidden()).context("Erase failed")? {
        JobOutput::Done => {
            if !settings.quiet {
                eprintln!("{} Chip erased", style("✓").green());
            }
            Ok(())
        },
        other => Err(unexpected(&other)),
    }
}

/// Blank check command implementation.
pub(crate) fn cmd_blank_check(settings: &Settings) -> Result<()> {
    let mut session = settings.open_session()?;

    // Older firmware has no `bc`, the check then reads the whole cartridge
    let pb = if session
        .capabilities()?
        .supports(Capability::BlankCheck)
    {
        ProgressBar::hidden()
    } else {
        byte_counter(settings.quiet)
    };

    let status = match run_job(settings, session, Job::BlankCheck, pb)? {
        JobOutput::Blank(status) => status,
        other => return Err(unexpected(&other)),
    };

    let verdict = if status.is_blank() {
        style("Cartridge is blank").green()
    } else {
        style("Cartridge is not blank").yellow()
    };
    match status {
        BlankStatus::Device { .. } => eprintln!("{verdict}"),
        BlankStatus::Readback {
            non_blank_bytes,
            size,
        } => eprintln!("{verdict} ({non_blank_bytes} of {size} bytes not erased)"),
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(settings: &Settings, input: &Path) -> Result<()> {
    let expected = read_image(input)?;
    let session = settings.open_session()?;
    let total = expected.len() as u64;

    let pb = byte_progress(settings.quiet, total);
    match run_job(settings, session, Job::Verify { expected }, pb)? {
        JobOutput::Verified(outcome) => report_verify(settings, outcome),
        other => Err(unexpected(&other)),
    }
}

/// Bootloader command implementation.
pub(crate) fn cmd_bootloader(settings: &Settings) -> Result<()> {
    let mut session = settings.open_session()?;
    match session.enter_bootloader()? {
        ExchangeOutcome::Disconnected => {
            if !settings.quiet {
                eprintln!("{} Programmer is in bootloader mode", style("✓").green());
            }
            Ok(())
        },
        ExchangeOutcome::Answered(text) => {
            bail!("Programmer stayed in command mode: {}", text.trim())
        },
    }
}
