//! Ctrl-C handling for batch runs.
//!
//! The first SIGINT cancels the batch: no new instances start, in-flight ones
//! finish. A second SIGINT exits immediately.

use anyhow::Result;

use crate::run::CancelToken;

#[cfg(unix)]
pub fn install(cancel: CancelToken) -> Result<()> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};
    use tracing::warn;

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    // Must run before any worker starts so every thread inherits the mask.
    // Child commands inherit it too and are not interrupted.
    set.thread_block().context("block SIGINT")?;
    std::thread::spawn(move || {
        while set.wait().is_ok() {
            if cancel.is_cancelled() {
                warn!("second interrupt, exiting immediately");
                std::process::exit(130);
            }
            warn!("interrupt received, finishing in-flight instances (press Ctrl-C again to exit)");
            cancel.cancel();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install(_cancel: CancelToken) -> Result<()> {
    Ok(())
}
