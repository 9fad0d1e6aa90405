//! The error state machine.
//!
//! A single task owns the health of the compaction subsystem. It consumes
//! every outcome the transact runner publishes and moves between three
//! states: no error, transient, persistent. While transient, it offers the
//! current error to fail-fast writers; once persistent it additionally
//! offers on the persistent channel and acquires the write lock so new
//! writes stop passing through. Peers interact only over channels, so the
//! state needs no lock.

use std::sync::Arc;

use crate::{
    compaction::CompactionCore,
    error::Error,
    observability::{log_info, log_warn},
};

enum State {
    NoError,
    Transient(Error),
    Persistent(Error),
}

fn classify(current: State, input: Option<Error>) -> State {
    match (current, input) {
        (State::Persistent(err), _) => State::Persistent(err),
        (_, Some(err)) if err.is_corrupted() => State::Persistent(err),
        (_, Some(err)) => State::Transient(err),
        (_, None) => State::NoError,
    }
}

/// Run the error state machine until shutdown.
pub(crate) async fn error_loop(core: Arc<CompactionCore>) {
    let chans = &core.chans;
    let mut state = State::NoError;
    let mut wlocked = false;
    loop {
        state = match state {
            State::NoError => {
                tokio::select! {
                    set = chans.err_set_rx.recv_async() => match set {
                        Ok(input) => {
                            let next = classify(State::NoError, input);
                            log_transition(&next);
                            next
                        }
                        Err(_) => return,
                    },
                    _ = core.shutdown.wait() => return,
                }
            }
            State::Transient(err) => {
                tokio::select! {
                    r = chans.err_tx.send_async(err.clone()) => {
                        let _ = r;
                        State::Transient(err)
                    }
                    set = chans.err_set_rx.recv_async() => match set {
                        Ok(input) => {
                            let next = classify(State::Transient(err), input);
                            log_transition(&next);
                            next
                        }
                        Err(_) => return,
                    },
                    _ = core.shutdown.wait() => return,
                }
            }
            State::Persistent(err) => {
                tokio::select! {
                    r = chans.err_tx.send_async(err.clone()) => {
                        let _ = r;
                        State::Persistent(err)
                    }
                    r = chans.per_err_tx.send_async(err.clone()) => {
                        let _ = r;
                        State::Persistent(err)
                    }
                    r = chans.write_lock_tx.send_async(()), if !wlocked => {
                        // Holding the write lock keeps new writes from
                        // passing through while the subsystem is wedged.
                        let _ = r;
                        wlocked = true;
                        log_warn!(
                            component = "compaction",
                            event = "write_lock_held",
                            error = %err,
                        );
                        State::Persistent(err)
                    }
                    _ = core.shutdown.wait() => {
                        if wlocked {
                            // Release, or closing the database would hang.
                            let _ = chans.write_lock_rx.try_recv();
                        }
                        return;
                    }
                }
            }
        };
    }
}

fn log_transition(next: &State) {
    match next {
        State::NoError => {}
        State::Transient(err) => log_info!(
            component = "compaction",
            event = "transient_error_set",
            error = %err,
        ),
        State::Persistent(err) => log_warn!(
            component = "compaction",
            event = "persistent_error_set",
            error = %err,
        ),
    }
}
