use std::any::Any;
use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::{ProgressStyle, style::TemplateError};

const ANSI_BLUE: Style = Style::new().blue();

/// Style of the overall progress bar of a run.
pub(crate) fn get_style_main() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Style of a single running task, no progress.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        String::from("panicked with unknown payload")
    }
}
