//! Property test: whatever order steps finish in, no step starts before its
//! predecessors have completed, and nothing behind the approval barrier
//! starts before every gated document is approved.

mod common;

use std::time::Duration;

use proptest::prelude::*;

use onboarding_orchestrator::workflow::{
    ApprovalStatus, StepStatus, StepType, WorkflowEvent, WorkflowStatus,
};

use common::*;

fn run_with_delays(delays: Vec<u64>) -> (Vec<WorkflowEvent>, Vec<(StepType, Vec<StepType>)>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(within(async move {
        let collaborators = ScriptedCollaborators::new();
        for (step, ms) in StepType::ALL.into_iter().zip(delays) {
            collaborators.delay(step, Duration::from_millis(ms));
        }
        collaborators.hold(StepType::ParseData);
        let h = harness_with(collaborators).await;

        let id = h.engine.start("emp-prop").await.unwrap();
        let subscription = h.engine.subscribe(id).await.unwrap();
        let events = tokio::spawn(collect_events(subscription));
        h.collaborators.release(StepType::ParseData);

        let approver = spawn_auto_approver(h.engine.clone(), id);
        wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;
        approver.await.unwrap();

        let predecessors = StepType::ALL
            .into_iter()
            .map(|step| {
                let preds = h.engine.catalog().get(step).unwrap().predecessors.to_vec();
                (step, preds)
            })
            .collect();
        (events.await.unwrap(), predecessors)
    }))
}

fn position(events: &[WorkflowEvent], step: StepType, status: StepStatus) -> Option<usize> {
    events.iter().position(|e| {
        matches!(e, WorkflowEvent::StepUpdate { step_type, status: s, .. } if *step_type == step && *s == status)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn steps_never_start_before_predecessors(delays in proptest::collection::vec(0u64..12, 10)) {
        let (events, predecessors) = run_with_delays(delays);

        prop_assert!(matches!(events.first(), Some(WorkflowEvent::Init { .. })), "first event must be Init");
        prop_assert!(matches!(
            events.last(),
            Some(WorkflowEvent::Done { status: WorkflowStatus::Completed, .. })
        ), "last event must be Done(Completed)");

        for (step, preds) in &predecessors {
            let started = position(&events, *step, StepStatus::Running);
            prop_assert!(started.is_some(), "{} never ran", step);
            let started = started.unwrap();
            for pred in preds {
                let done = position(&events, *pred, StepStatus::Completed);
                prop_assert!(
                    done.is_some_and(|d| d < started),
                    "{} started before {} completed", step, pred
                );
            }
        }

        let welcome = position(&events, StepType::WelcomeEmail, StepStatus::Running).unwrap();
        let approvals = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, WorkflowEvent::ApprovalUpdate { status: ApprovalStatus::Approved, .. }))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        prop_assert_eq!(approvals.len(), 4);
        prop_assert!(approvals.iter().all(|&i| i < welcome));
    }
}
