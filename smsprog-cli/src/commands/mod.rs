//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod cartridge;
pub(crate) mod firmware;
pub(crate) mod info;

use {
    crate::use_fancy_output,
    indicatif::{ProgressBar, ProgressStyle},
};

/// Byte progress bar on stderr, hidden when quiet or not on a terminal.
pub(crate) fn byte_progress(quiet: bool, total: u64) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Byte counter for transfers of unknown size.
pub(crate) fn byte_counter(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::no_length();
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} {msg}")
            .unwrap(),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}
