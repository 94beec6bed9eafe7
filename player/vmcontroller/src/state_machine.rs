/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Table-driven lifecycle state machine for VirtualMachine resources.
//!
//! ```text
//! Pending -> Provisioning -> {Running <-> Stopped <-> Suspended} -> Deleting -> Deleted
//! ```
//!
//! `Failed` is reachable from every non-terminal phase on a permanent error
//! and is left only when the desired spec gets a new generation.

use crate::types::{
    StateTransition, EVENT_ABSENCE_CONFIRMED, EVENT_CONVERGED, EVENT_DELETE_REQUESTED,
    EVENT_PERMANENT_ERROR, EVENT_PROVISION_REQUESTED, EVENT_SPEC_CHANGED,
};
use common::spec::VmPhase;

const STEADY: [VmPhase; 3] = [VmPhase::Running, VmPhase::Stopped, VmPhase::Suspended];

const NON_TERMINAL: [VmPhase; 7] = [
    VmPhase::Pending,
    VmPhase::Provisioning,
    VmPhase::Running,
    VmPhase::Stopped,
    VmPhase::Suspended,
    VmPhase::Deleting,
    VmPhase::Failed,
];

pub struct StateMachine {
    transitions: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let mut state_machine = StateMachine {
            transitions: Vec::new(),
        };
        state_machine.initialize_lifecycle_transitions();
        state_machine.initialize_power_transitions();
        state_machine.initialize_deletion_transitions();
        state_machine.initialize_failure_transitions();
        state_machine
    }

    fn push(&mut self, from: VmPhase, event: &'static str, to: VmPhase, action: &'static str) {
        self.transitions.push(StateTransition {
            from_state: from,
            event,
            to_state: to,
            action,
        });
    }

    // ========================================
    // TRANSITION TABLES
    // ========================================

    fn initialize_lifecycle_transitions(&mut self) {
        self.push(
            VmPhase::Pending,
            EVENT_PROVISION_REQUESTED,
            VmPhase::Provisioning,
            "issue_create_or_clone",
        );
        // a vanished steady VM is provisioned again
        for from in STEADY {
            self.push(
                from,
                EVENT_PROVISION_REQUESTED,
                VmPhase::Provisioning,
                "recreate_missing_vm",
            );
        }
        for to in STEADY {
            self.push(VmPhase::Pending, EVENT_CONVERGED, to, "adopt_existing_vm");
            self.push(VmPhase::Provisioning, EVENT_CONVERGED, to, "announce_availability");
        }
    }

    fn initialize_power_transitions(&mut self) {
        for from in STEADY {
            for to in STEADY {
                self.push(from, EVENT_CONVERGED, to, "record_power_state");
            }
        }
    }

    fn initialize_deletion_transitions(&mut self) {
        for from in NON_TERMINAL {
            if from != VmPhase::Deleting {
                self.push(from, EVENT_DELETE_REQUESTED, VmPhase::Deleting, "issue_delete");
            }
        }
        self.push(
            VmPhase::Deleting,
            EVENT_ABSENCE_CONFIRMED,
            VmPhase::Deleted,
            "remove_from_store",
        );
    }

    fn initialize_failure_transitions(&mut self) {
        for from in NON_TERMINAL {
            if from != VmPhase::Failed {
                self.push(from, EVENT_PERMANENT_ERROR, VmPhase::Failed, "park_until_spec_change");
            }
        }
        self.push(
            VmPhase::Failed,
            EVENT_SPEC_CHANGED,
            VmPhase::Provisioning,
            "retry_with_new_generation",
        );
    }

    // ========================================
    // LOOKUP
    // ========================================

    /// Validate a phase change. Staying in the same phase is always allowed.
    pub fn transition(
        &self,
        from: VmPhase,
        event: &str,
        to: VmPhase,
    ) -> Result<Option<&StateTransition>, String> {
        if from == to {
            return Ok(None);
        }
        self.transitions
            .iter()
            .find(|t| t.from_state == from && t.event == event && t.to_state == to)
            .map(Some)
            .ok_or_else(|| format!("invalid transition {from} -[{event}]-> {to}"))
    }

    pub fn is_terminal(phase: VmPhase) -> bool {
        phase == VmPhase::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new();
        assert!(sm
            .transition(VmPhase::Pending, EVENT_PROVISION_REQUESTED, VmPhase::Provisioning)
            .is_ok());
        let t = sm
            .transition(VmPhase::Provisioning, EVENT_CONVERGED, VmPhase::Running)
            .unwrap()
            .unwrap();
        assert_eq!(t.action, "announce_availability");
        assert!(sm
            .transition(VmPhase::Running, EVENT_CONVERGED, VmPhase::Stopped)
            .is_ok());
        assert!(sm
            .transition(VmPhase::Stopped, EVENT_DELETE_REQUESTED, VmPhase::Deleting)
            .is_ok());
        assert!(sm
            .transition(VmPhase::Deleting, EVENT_ABSENCE_CONFIRMED, VmPhase::Deleted)
            .is_ok());
    }

    #[test]
    fn test_failed_is_absorbing_except_spec_change_and_delete() {
        let sm = StateMachine::new();
        assert!(sm
            .transition(VmPhase::Failed, EVENT_CONVERGED, VmPhase::Running)
            .is_err());
        assert!(sm
            .transition(VmPhase::Failed, EVENT_SPEC_CHANGED, VmPhase::Provisioning)
            .is_ok());
        assert!(sm
            .transition(VmPhase::Failed, EVENT_DELETE_REQUESTED, VmPhase::Deleting)
            .is_ok());
    }

    #[test]
    fn test_failure_reachable_from_every_non_terminal_phase() {
        let sm = StateMachine::new();
        for from in NON_TERMINAL {
            if from == VmPhase::Failed {
                continue;
            }
            assert!(
                sm.transition(from, EVENT_PERMANENT_ERROR, VmPhase::Failed).is_ok(),
                "{from} cannot fail"
            );
        }
        assert!(sm
            .transition(VmPhase::Deleted, EVENT_PERMANENT_ERROR, VmPhase::Failed)
            .is_err());
    }

    #[test]
    fn test_deleted_is_terminal() {
        let sm = StateMachine::new();
        assert!(StateMachine::is_terminal(VmPhase::Deleted));
        assert!(sm
            .transition(VmPhase::Deleted, EVENT_PROVISION_REQUESTED, VmPhase::Provisioning)
            .is_err());
    }

    #[test]
    fn test_same_phase_is_noop() {
        let sm = StateMachine::new();
        assert_eq!(
            sm.transition(VmPhase::Running, EVENT_CONVERGED, VmPhase::Running),
            Ok(None)
        );
    }
}
