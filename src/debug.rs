// SPDX-License-Identifier: MIT

use console::style;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::Level;

pub static DEBUG: AtomicUsize = AtomicUsize::new(0);

static CALL_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Installs the log subscriber. Each `--debug` raises the level by one,
/// starting at INFO.
pub fn init(level: usize) {
    DEBUG.store(level, Ordering::SeqCst);
    let max = match level {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(max)
        .with_target(level > 1)
        .try_init();
}

/// Label of one step. Steps are counted over the whole process run, the
/// total is not known up front.
fn step_label(step: usize) -> String {
    format!("[{}]", step)
}

/// Emits one numbered step, mostly SQL statements.
pub fn print_step(msg: String) {
    let s = CALL_COUNT.fetch_add(1, Ordering::SeqCst);
    if DEBUG.load(Ordering::SeqCst) == 0 {
        return;
    }
    tracing::debug!("Step {}: {}", style(step_label(s)).bold().dim(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_label_test() {
        assert_eq!("[7]", step_label(7));
        assert_eq!("[1234]", step_label(1234));
    }
}
