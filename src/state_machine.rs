//! Phase state machine for one test attempt
//!
//! All phase changes go through `reduce()`, which returns the next progress
//! and the effects the coordinator must run. `None` means the event is not
//! legal in the current phase and nothing changes.
//!
//! ```text
//! Preparation(k) ──BeginResponse──▶ Response(k) ──Advance──▶ Preparation(k+1)
//!                                       │
//!                            (k == total) RequestCompletion ─▶ ScoresReady ─▶ Completed
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    Response,
    Completed,
}

/// Position within the task sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// 1-based
    pub task_index: u32,
    pub total_tasks: u32,
    pub phase: Phase,
    /// The current task's response was accepted by the backend
    pub submitted: bool,
}

impl Progress {
    /// First task, in Preparation
    pub fn new(total_tasks: u32) -> Self {
        Self {
            task_index: 1,
            total_tasks,
            phase: Phase::Preparation,
            submitted: false,
        }
    }

    pub fn is_last_task(&self) -> bool {
        self.task_index >= self.total_tasks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Task content for `index` arrived
    TaskLoaded { index: u32 },
    BeginResponse,
    /// Upload and submission both succeeded
    ResponseAccepted,
    /// Move past the current task
    Advance,
    /// Caller asked to finish the test
    RequestCompletion,
    /// Aggregate score arrived
    ScoresReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartCapture,
    /// Stop capture; the audio is held until the phase moves on
    StopCapture,
    /// Tell the live stream which task is starting
    SignalTaskStart,
    LoadTask { index: u32 },
    RequestScores,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Progress,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Progress, effects: Vec<Effect>) -> Option<Self> {
        Some(Self { next, effects })
    }
}

/// Reducer function: (progress, event) -> transition
///
/// Key rules:
/// - Completed is terminal
/// - A task's response is accepted at most once
/// - Completion only from the last task
pub fn reduce(progress: &Progress, event: Event) -> Option<Transition> {
    use Effect::*;
    use Event::*;
    use Phase::*;

    let capture_running = progress.phase == Response && !progress.submitted;

    match (progress.phase, event) {
        (Completed, _) => None,

        (_, TaskLoaded { index }) => {
            if index == 0 || index > progress.total_tasks {
                return None;
            }
            let mut effects = Vec::new();
            if capture_running {
                effects.push(StopCapture);
            }
            effects.push(SignalTaskStart);

            Transition::to(
                Progress {
                    task_index: index,
                    phase: Preparation,
                    // Re-opening an answered task must not allow a second answer
                    submitted: index == progress.task_index && progress.submitted,
                    ..*progress
                },
                effects,
            )
        }

        (Preparation, BeginResponse) if !progress.submitted => Transition::to(
            Progress {
                phase: Response,
                ..*progress
            },
            vec![StartCapture],
        ),

        (Response, ResponseAccepted) if !progress.submitted => Transition::to(
            Progress {
                submitted: true,
                ..*progress
            },
            vec![],
        ),

        (_, Advance) => {
            let mut effects = Vec::new();
            if capture_running {
                effects.push(StopCapture);
            }

            if progress.is_last_task() {
                effects.push(RequestScores);
                return Transition::to(*progress, effects);
            }

            let index = progress.task_index + 1;
            effects.push(LoadTask { index });
            Transition::to(
                Progress {
                    task_index: index,
                    phase: Preparation,
                    submitted: false,
                    ..*progress
                },
                effects,
            )
        }

        (_, RequestCompletion) if progress.is_last_task() => {
            let mut effects = Vec::new();
            if capture_running {
                effects.push(StopCapture);
            }
            effects.push(RequestScores);
            Transition::to(*progress, effects)
        }

        (_, ScoresReady) if progress.is_last_task() => Transition::to(
            Progress {
                phase: Completed,
                ..*progress
            },
            vec![],
        ),

        _ => None,
    }
}
