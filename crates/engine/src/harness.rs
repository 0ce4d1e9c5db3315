//! Asynchronous run harness.
//!
//! The driver hands out jobs lazily; something still has to pump it. This
//! module converts a workflow run into a cooperative task that executes each
//! job inline, emits [`RunEvent`]s over a Tokio channel, and responds to
//! pause/resume/cancel controls. The caller owns the event receiver and the
//! control sender.
//!
//! The engine core is single-threaded (`Rc`-based); drive the returned
//! future on a current-thread runtime.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{info, warn};

use crate::context::RuntimeContext;
use crate::process::{JobPoll, OutputCallback, Process};
use crate::state::ProcessStatus;
use crate::value::ValueMap;

/// Control commands accepted while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Pause,
    Resume,
    Cancel,
}

/// Lifecycle state reported through [`RunEvent::RunStatusChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

/// Lifecycle events emitted while driving a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        at: DateTime<Utc>,
    },
    RunStatusChanged {
        status: RunStatus,
    },
    JobStarted {
        name: String,
        at: DateTime<Utc>,
    },
    JobFinished {
        name: String,
        duration_ms: u64,
    },
    RunCompleted {
        status: RunStatus,
        outputs: ValueMap,
        finished_at: DateTime<Utc>,
    },
}

/// Drives `process` to completion, executing each job inline.
///
/// Events stream over `event_tx`; a closed event channel ends the run
/// quietly. Cancellation takes effect at the next job boundary.
pub async fn drive_workflow(
    process: &dyn Process,
    joborder: ValueMap,
    ctx: &RuntimeContext,
    mut control_rx: UnboundedReceiver<RunControl>,
    event_tx: UnboundedSender<RunEvent>,
) -> Result<()> {
    let outcome: Rc<RefCell<Option<(ValueMap, ProcessStatus)>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let callback: OutputCallback = Rc::new(move |outputs, status| {
        *sink.borrow_mut() = Some((outputs, status));
    });

    if event_tx.send(RunEvent::RunStarted { at: Utc::now() }).is_err() {
        return Ok(());
    }

    let mut source = match process.job(joborder, callback, ctx) {
        Ok(source) => source,
        Err(error) => {
            warn!(error = %error, "workflow failed to start");
            let _ = event_tx.send(RunEvent::RunCompleted {
                status: RunStatus::Failed,
                outputs: ValueMap::new(),
                finished_at: Utc::now(),
            });
            return Ok(());
        }
    };

    let mut control = ControlState::new();
    let _ = event_tx.send(RunEvent::RunStatusChanged { status: RunStatus::Running });

    loop {
        drain_pending_commands(&mut control, &mut control_rx, &event_tx);
        if control.cancel_requested {
            break;
        }
        if control.paused {
            wait_for_resume(&mut control, &mut control_rx, &event_tx).await;
            if control.cancel_requested {
                break;
            }
        }

        match source.pull_next() {
            Ok(JobPoll::Ready(mut job)) => {
                let name = job.name().to_string();
                let _ = event_tx.send(RunEvent::JobStarted {
                    name: name.clone(),
                    at: Utc::now(),
                });
                let started = Instant::now();
                if let Err(error) = job.run(ctx) {
                    warn!(job = %name, error = %error, "job failed");
                }
                let duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
                let _ = event_tx.send(RunEvent::JobFinished { name, duration_ms });
            }
            Ok(JobPoll::Stalled) => {
                // Jobs run inline, so a stall can never resolve itself.
                bail!("workflow cannot make any more progress: all steps stalled");
            }
            Ok(JobPoll::Finished) => break,
            Err(error) => return Err(error.into()),
        }
    }

    let (outputs, status) = match outcome.borrow_mut().take() {
        Some((outputs, status)) => {
            let status = if control.cancel_requested {
                RunStatus::Canceled
            } else if status.is_terminal_ok() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            (outputs, status)
        }
        None => {
            let status = if control.cancel_requested { RunStatus::Canceled } else { RunStatus::Failed };
            (ValueMap::new(), status)
        }
    };
    info!(status = ?status, "run finished");
    let _ = event_tx.send(RunEvent::RunCompleted {
        status,
        outputs,
        finished_at: Utc::now(),
    });
    Ok(())
}

fn drain_pending_commands(control: &mut ControlState, control_rx: &mut UnboundedReceiver<RunControl>, event_tx: &UnboundedSender<RunEvent>) {
    loop {
        match control_rx.try_recv() {
            Ok(command) => control.process_command(command, event_tx),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

async fn wait_for_resume(control: &mut ControlState, control_rx: &mut UnboundedReceiver<RunControl>, event_tx: &UnboundedSender<RunEvent>) {
    while control.paused && !control.cancel_requested {
        match control_rx.recv().await {
            Some(command) => control.process_command(command, event_tx),
            None => break,
        }
    }
}

struct ControlState {
    paused: bool,
    cancel_requested: bool,
}

impl ControlState {
    fn new() -> Self {
        Self {
            paused: false,
            cancel_requested: false,
        }
    }

    fn process_command(&mut self, command: RunControl, event_tx: &UnboundedSender<RunEvent>) {
        match command {
            RunControl::Pause => {
                if !self.paused && !self.cancel_requested {
                    self.paused = true;
                    let _ = event_tx.send(RunEvent::RunStatusChanged { status: RunStatus::Paused });
                }
            }
            RunControl::Resume => {
                if self.paused {
                    self.paused = false;
                    let _ = event_tx.send(RunEvent::RunStatusChanged { status: RunStatus::Running });
                }
            }
            RunControl::Cancel => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.paused = false;
                }
            }
        }
    }
}
