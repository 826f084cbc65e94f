//! Step catalog: the onboarding DAG as data.
//!
//! Each step kind maps to its predecessors, whether its output needs human
//! approval, the approval barrier it waits on, and the collaborator it calls.
//! The engine runs one generic scheduling algorithm over this table.

use std::collections::{HashMap, HashSet};

use crate::collaborators::DocumentKind;

use super::approval::{self, BarrierState};
use super::model::{Step, StepStatus, StepType};

/// The external collaborator a step invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorBinding {
    LoadEmployee,
    DetectJurisdiction,
    GenerateDocument(DocumentKind),
    ComposeWelcomeEmail,
    ComposePlan,
    ScheduleCalendarEvents,
    ComposeEquipmentRequest,
}

/// Static definition of one step kind.
#[derive(Debug, Clone, Copy)]
pub struct StepDef {
    pub step_type: StepType,
    pub predecessors: &'static [StepType],
    pub requires_approval: bool,
    /// Gated steps whose approvals must all be `approved` before this step starts.
    pub approval_barrier: &'static [StepType],
    pub collaborator: CollaboratorBinding,
}

const DOCUMENT_STEPS: &[StepType] = &[
    StepType::EmploymentContract,
    StepType::Nda,
    StepType::EquityAgreement,
    StepType::OfferLetter,
];

static ONBOARDING_STEPS: &[StepDef] = &[
    StepDef {
        step_type: StepType::ParseData,
        predecessors: &[],
        requires_approval: false,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::LoadEmployee,
    },
    StepDef {
        step_type: StepType::DetectJurisdiction,
        predecessors: &[StepType::ParseData],
        requires_approval: false,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::DetectJurisdiction,
    },
    StepDef {
        step_type: StepType::EmploymentContract,
        predecessors: &[StepType::DetectJurisdiction],
        requires_approval: true,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::GenerateDocument(DocumentKind::EmploymentContract),
    },
    StepDef {
        step_type: StepType::Nda,
        predecessors: &[StepType::DetectJurisdiction],
        requires_approval: true,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::GenerateDocument(DocumentKind::Nda),
    },
    StepDef {
        step_type: StepType::EquityAgreement,
        predecessors: &[StepType::EmploymentContract],
        requires_approval: true,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::GenerateDocument(DocumentKind::EquityAgreement),
    },
    StepDef {
        step_type: StepType::OfferLetter,
        predecessors: &[StepType::Nda],
        requires_approval: true,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::GenerateDocument(DocumentKind::OfferLetter),
    },
    StepDef {
        step_type: StepType::WelcomeEmail,
        predecessors: &[StepType::EquityAgreement, StepType::OfferLetter],
        requires_approval: false,
        approval_barrier: DOCUMENT_STEPS,
        collaborator: CollaboratorBinding::ComposeWelcomeEmail,
    },
    StepDef {
        step_type: StepType::Plan306090,
        predecessors: &[StepType::WelcomeEmail],
        requires_approval: false,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::ComposePlan,
    },
    StepDef {
        step_type: StepType::ScheduleEvents,
        predecessors: &[StepType::WelcomeEmail],
        requires_approval: false,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::ScheduleCalendarEvents,
    },
    StepDef {
        step_type: StepType::EquipmentRequest,
        predecessors: &[StepType::Plan306090, StepType::ScheduleEvents],
        requires_approval: false,
        approval_barrier: &[],
        collaborator: CollaboratorBinding::ComposeEquipmentRequest,
    },
];

/// Registry of step definitions with a cached topological order.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    defs: &'static [StepDef],
    topo_order: Vec<StepType>,
}

impl StepCatalog {
    /// The standard ten-step onboarding catalog.
    pub fn onboarding() -> Self {
        // The static table is covered by tests; a failure here is a programming error.
        Self::new(ONBOARDING_STEPS).unwrap_or_else(|e| panic!("invalid onboarding catalog: {e}"))
    }

    /// Build a catalog, validating that the table forms a DAG.
    pub fn new(defs: &'static [StepDef]) -> Result<Self, String> {
        let known: HashSet<StepType> = defs.iter().map(|d| d.step_type).collect();
        if known.len() != defs.len() {
            return Err("duplicate step definition".to_string());
        }
        for def in defs {
            for dep in def.predecessors.iter().chain(def.approval_barrier) {
                if !known.contains(dep) {
                    return Err(format!("{} depends on undefined step {}", def.step_type, dep));
                }
            }
            for gated in def.approval_barrier {
                let gated_def = defs.iter().find(|d| d.step_type == *gated);
                if !gated_def.is_some_and(|d| d.requires_approval) {
                    return Err(format!(
                        "{} waits on {}, which does not require approval",
                        def.step_type, gated
                    ));
                }
            }
        }

        // Kahn's algorithm, keeping table order among peers.
        let mut in_degree: HashMap<StepType, usize> = defs
            .iter()
            .map(|d| (d.step_type, d.predecessors.len()))
            .collect();
        let mut topo_order = Vec::with_capacity(defs.len());
        while topo_order.len() < defs.len() {
            let next = defs
                .iter()
                .find(|d| !topo_order.contains(&d.step_type) && in_degree[&d.step_type] == 0)
                .ok_or_else(|| "step definitions contain a cycle".to_string())?;
            topo_order.push(next.step_type);
            for succ in defs.iter().filter(|d| d.predecessors.contains(&next.step_type)) {
                if let Some(n) = in_degree.get_mut(&succ.step_type) {
                    *n -= 1;
                }
            }
        }

        Ok(Self { defs, topo_order })
    }

    /// Look up a step definition.
    pub fn get(&self, step_type: StepType) -> Option<&StepDef> {
        self.defs.iter().find(|d| d.step_type == step_type)
    }

    /// Step kinds in topological order.
    pub fn topological_order(&self) -> &[StepType] {
        &self.topo_order
    }

    /// One-based topological rank, used as `step_order`.
    pub fn rank(&self, step_type: StepType) -> u32 {
        self.topo_order
            .iter()
            .position(|t| *t == step_type)
            .map(|i| i as u32 + 1)
            .unwrap_or(0)
    }

    /// Direct successors of a step.
    pub fn successors(&self, step_type: StepType) -> Vec<StepType> {
        self.defs
            .iter()
            .filter(|d| d.predecessors.contains(&step_type))
            .map(|d| d.step_type)
            .collect()
    }

    /// Steps that wait on an approval barrier.
    /// Number of step kinds.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn barriers(&self) -> impl Iterator<Item = &StepDef> {
        self.defs.iter().filter(|d| !d.approval_barrier.is_empty())
    }

    /// Fresh pending step records for a new workflow, in topological order.
    pub fn seed_steps(&self, workflow_id: uuid::Uuid) -> Vec<Step> {
        self.topo_order
            .iter()
            .filter_map(|t| self.get(*t))
            .map(|def| {
                Step::new(
                    workflow_id,
                    def.step_type,
                    self.rank(def.step_type),
                    def.requires_approval,
                )
            })
            .collect()
    }

    /// Compute the ready set: pending steps whose predecessors are all
    /// completed and whose approval barrier (if any) has cleared.
    pub fn ready_set(&self, steps: &[Step]) -> Vec<StepType> {
        let by_type: HashMap<StepType, &Step> = steps.iter().map(|s| (s.step_type, s)).collect();

        self.topo_order
            .iter()
            .filter_map(|t| self.get(*t))
            .filter(|def| {
                by_type
                    .get(&def.step_type)
                    .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .filter(|def| {
                def.predecessors.iter().all(|p| {
                    by_type
                        .get(p)
                        .is_some_and(|s| s.status == StepStatus::Completed)
                })
            })
            .filter(|def| {
                def.approval_barrier.is_empty()
                    || approval::barrier_state(def.approval_barrier, steps) == BarrierState::Cleared
            })
            .map(|def| def.step_type)
            .collect()
    }
}
