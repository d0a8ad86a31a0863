use std::time::Duration;

use crossbeam_channel::Receiver;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub(super) enum PBarNotification {
    Total(u64),
    Queued,
    Inc,
}

pub(super) fn get_index_spinner(multi: Option<&MultiProgress>, msg: &str) -> ProgressBar {
    let spinner = multi.map_or_else(ProgressBar::new_spinner, |m| {
        m.add(ProgressBar::new_spinner())
    });
    spinner.enable_steady_tick(Duration::from_millis(80));
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {msg} {spinner:.blue}") {
        spinner.set_style(
            style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", ""]),
        );
    }
    spinner.set_message(msg.to_owned());

    spinner
}

pub(super) fn set_index_spinner_finish(n_reads: usize, what: &str, spinner: ProgressBar) {
    spinner.finish_with_message(format!("Indexed {} {}.", n_reads, what));
}

fn get_reads_pbar() -> ProgressBar {
    let pbar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.blue} {pos}/{len} reads ({per_sec}, eta {eta})",
    ) {
        pbar.set_style(style);
    }

    pbar
}

pub(super) fn track_progress(receiver: Receiver<PBarNotification>) {
    let pbar = get_reads_pbar();

    loop {
        match receiver.recv() {
            Ok(PBarNotification::Total(n)) => pbar.set_length(n),
            Ok(PBarNotification::Queued) => pbar.inc_length(1),
            Ok(PBarNotification::Inc) => pbar.inc(1),
            Err(_) => break,
        }
    }

    pbar.finish();
}
