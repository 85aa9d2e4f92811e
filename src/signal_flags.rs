//! Process-wide signal flags.
//!
//! The three flags the handlers may touch are plain atomics, initialized
//! before any thread spawns. Handlers do nothing but store; the main loop
//! reads and reacts at its next iteration head.
//!
//! - SIGINT / SIGTERM: stop (an in-flight replay save completes first)
//! - SIGUSR1: save the replay buffer
//! - SIGUSR2: toggle pause

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::warn;

static RUNNING: AtomicBool = AtomicBool::new(true);
static SAVE_REPLAY: AtomicBool = AtomicBool::new(false);
static TOGGLE_PAUSE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_: i32) {
    RUNNING.store(false, Ordering::SeqCst);
}

extern "C" fn handle_save_replay(_: i32) {
    SAVE_REPLAY.store(true, Ordering::SeqCst);
}

extern "C" fn handle_toggle_pause(_: i32) {
    TOGGLE_PAUSE.store(true, Ordering::SeqCst);
}

/// Install the handlers. Call once, before spawning threads.
pub fn install() {
    let actions = [
        (Signal::SIGINT, SigHandler::Handler(handle_stop)),
        (Signal::SIGTERM, SigHandler::Handler(handle_stop)),
        (Signal::SIGUSR1, SigHandler::Handler(handle_save_replay)),
        (Signal::SIGUSR2, SigHandler::Handler(handle_toggle_pause)),
    ];
    for (signal, handler) in actions {
        let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
        // SAFETY: the handlers only store to atomics, which is
        // async-signal-safe.
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            warn!("Failed to install handler for {:?}: {}", signal, e);
        }
    }
}

/// Whether the main loop should keep running.
pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// Request an orderly stop (same path as SIGINT).
pub fn request_stop() {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Take the save-replay request, clearing it.
pub fn take_save_replay() -> bool {
    SAVE_REPLAY.swap(false, Ordering::SeqCst)
}

/// Take the pause-toggle request, clearing it.
pub fn take_toggle_pause() -> bool {
    TOGGLE_PAUSE.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_take_semantics() {
        assert!(running());

        SAVE_REPLAY.store(true, Ordering::SeqCst);
        assert!(take_save_replay());
        assert!(!take_save_replay());

        TOGGLE_PAUSE.store(true, Ordering::SeqCst);
        assert!(take_toggle_pause());
        assert!(!take_toggle_pause());
    }
}
