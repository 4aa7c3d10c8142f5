use std::fmt::Display;
use std::io::IsTerminal;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use sshproc::ProgressCallback;

pub fn brand_success<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).green()
}

pub fn brand_error<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).red()
}

pub fn brand_muted<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).dim()
}

pub fn success(message: &str) {
    println!("{} {}", brand_success("✓").bold(), message);
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", brand_error("✗").bold(), message);
}

pub fn muted(message: &str) {
    println!("{}", brand_muted(message));
}

/// Byte progress bar for a file transfer; hidden when stderr is not a terminal.
pub fn transfer_bar(name: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(0);
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(bar_style);
    bar.set_message(name.to_string());
    bar
}

/// Adapt a progress bar to the library's `(transferred, total)` callback.
pub fn progress_callback(bar: &ProgressBar) -> ProgressCallback {
    let bar = bar.clone();
    Box::new(move |transferred, total| {
        bar.set_length(total);
        bar.set_position(transferred);
    })
}
