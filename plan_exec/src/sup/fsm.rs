//! The supervisor's state set and transition table.
//!
//! Transition selection is a pure function of the events observed in one
//! cycle, so the table can be exercised in isolation from the planning
//! pipeline.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt::Display;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Init,
    WaitTarget,
    Replan,
    ExecTraj,
    GoalReached,
    EmergencyReplan,
    Exit,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Everything the transition table needs to know about one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleEvents {
    /// Odometry and a map update have both been received.
    pub inputs_present: bool,

    /// Execution is triggered and a goal waypoint is queued.
    pub goal_present: bool,

    /// The vehicle is within the goal tolerance of the goal.
    pub at_goal: bool,

    /// The routine replan timer has elapsed, or tracking has deviated beyond
    /// the replan tolerance.
    pub replan_due: bool,

    /// The committed trajectory has become unsafe (risk or peer conflict).
    pub committed_unsafe: bool,

    /// Result of a plan attempted this cycle, if one ran.
    pub plan_outcome: Option<bool>,
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// The transition table.
pub fn next_state(current: FsmState, ev: &CycleEvents) -> FsmState {
    match current {
        FsmState::Init => FsmState::WaitTarget,

        FsmState::WaitTarget => {
            if ev.inputs_present && ev.goal_present {
                FsmState::Replan
            } else {
                FsmState::WaitTarget
            }
        }

        FsmState::Replan => {
            if !ev.inputs_present {
                FsmState::WaitTarget
            } else if ev.at_goal {
                FsmState::GoalReached
            } else if ev.plan_outcome == Some(true) {
                FsmState::ExecTraj
            } else {
                // Plan failed or could not run, try again next tick
                FsmState::Replan
            }
        }

        FsmState::ExecTraj => {
            if !ev.inputs_present {
                FsmState::WaitTarget
            } else if ev.at_goal {
                FsmState::GoalReached
            } else if ev.committed_unsafe {
                FsmState::EmergencyReplan
            } else if ev.replan_due {
                FsmState::Replan
            } else {
                FsmState::ExecTraj
            }
        }

        FsmState::EmergencyReplan => {
            if !ev.inputs_present {
                FsmState::WaitTarget
            } else if ev.plan_outcome == Some(true) {
                FsmState::ExecTraj
            } else {
                FsmState::EmergencyReplan
            }
        }

        FsmState::GoalReached => FsmState::WaitTarget,

        FsmState::Exit => FsmState::Exit,
    }
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsmState::Init => "INIT",
            FsmState::WaitTarget => "WAIT_TARGET",
            FsmState::Replan => "REPLAN",
            FsmState::ExecTraj => "EXEC_TRAJ",
            FsmState::GoalReached => "GOAL_REACHED",
            FsmState::EmergencyReplan => "EMERGENCY_REPLAN",
            FsmState::Exit => "EXIT",
        };
        write!(f, "{}", s)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
