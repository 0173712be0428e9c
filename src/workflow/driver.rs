//! The orchestration loop: plan, dispatch, analyze, mutate, repeat
//!
//! One iteration takes a workflow through the full cycle: pick or plan the
//! next step, hand it to the sub-agent dispatcher, judge the result, and let
//! the modification engine rewrite what remains. Iterations for one workflow
//! are strictly sequential; workflows in different sessions interleave freely.

use super::analyzer::{StepAnalysis, StepResultAnalyzer};
use super::modification::PlanModificationEngine;
use super::planner::{PlanningContext, StepPlanner};
use super::state::{
    StepStatus, ToolCall, WorkflowContext, WorkflowState, WorkflowStatus, WorkflowStep,
};
use super::store::{WorkflowLocks, WorkflowStore};
use crate::config::OrchestrationConfig;
use crate::llm::LlmClient;
use crate::utils::errors::MaestroError;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of dispatching one step to a sub-agent
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Textual result the analyzer and user-facing response build on
    pub output: String,
    /// System-level success of the sub-agent call
    pub success: bool,
}

/// Sub-agent dispatch contract, injected at construction
///
/// The driver never reaches back into a master agent; routing a step's tool
/// call to a concrete domain agent (email, calendar, contacts, messaging) is
/// entirely the dispatcher's concern.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch_step(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
    ) -> Result<DispatchOutcome>;
}

/// Terminal result of driving one workflow
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    /// The request was fulfilled (or concluded with a best-effort answer)
    Completed { response: String },
    /// An interruption paused the workflow; it can be resumed later
    Paused,
    /// The workflow was cancelled mid-flight
    Cancelled,
    /// Planning failed hard; the user should retry
    Failed { response: String },
    /// The step ceiling was reached before completion
    StepLimitReached { response: String },
}

/// Drives workflows through the plan/dispatch/analyze/mutate cycle
pub struct WorkflowDriver {
    planner: StepPlanner,
    analyzer: StepResultAnalyzer,
    engine: PlanModificationEngine,
    store: Arc<dyn WorkflowStore>,
    locks: WorkflowLocks,
    dispatcher: Arc<dyn AgentDispatcher>,
    config: OrchestrationConfig,
    cancellation: CancellationToken,
}

impl WorkflowDriver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: OrchestrationConfig,
    ) -> Self {
        let locks = WorkflowLocks::new();
        Self {
            planner: StepPlanner::new(llm.clone(), config.result_preview_chars),
            analyzer: StepResultAnalyzer::new(llm.clone(), config.result_preview_chars),
            engine: PlanModificationEngine::new(
                llm,
                store.clone(),
                locks.clone(),
                config.default_max_retries,
                config.result_preview_chars,
            ),
            store,
            locks,
            dispatcher,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    /// Token the embedding host can use to stop all driving loops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Shared lock registry, for collaborators that mutate the same workflows
    pub fn locks(&self) -> WorkflowLocks {
        self.locks.clone()
    }

    /// Create and persist a fresh workflow for a session's request
    pub async fn start_workflow(&self, session_id: &str, request: &str) -> Result<WorkflowState> {
        let workflow = WorkflowState::new(session_id, request);
        self.store.put_workflow(&workflow).await?;
        tracing::info!(
            workflow_id = workflow.workflow_id.as_str(),
            session_id,
            "workflow created"
        );
        Ok(workflow)
    }

    /// Flip a paused workflow back to active so `run_workflow` can continue it
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(workflow_id).await;
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            return Err(MaestroError::not_found(format!("workflow {}", workflow_id)));
        };
        if workflow.status == WorkflowStatus::Paused {
            workflow.status = WorkflowStatus::Active;
            workflow.touch();
            self.store.put_workflow(&workflow).await?;
            tracing::info!(workflow_id, "workflow resumed");
        }
        Ok(())
    }

    /// Drive a workflow until completion, pause, cancellation, or the ceiling
    pub async fn run_workflow(&self, workflow_id: &str) -> Result<WorkflowOutcome> {
        let mut summaries: Vec<String> = Vec::new();

        loop {
            // Every resumption point re-checks status so cooperative
            // cancellation and pauses take effect between suspensions
            let workflow = match self.checked_fetch(workflow_id).await? {
                Fetched::Running(workflow) => workflow,
                Fetched::Stopped(outcome) => return Ok(outcome),
            };

            let executed = workflow
                .plan
                .iter()
                .filter(|s| {
                    matches!(
                        s.status,
                        StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
                    )
                })
                .count();
            if executed >= self.config.max_steps_per_workflow {
                let response = self.finalize(workflow_id, &summaries, WorkflowStatus::Completed).await?;
                tracing::warn!(workflow_id, "step ceiling reached; concluding workflow");
                return Ok(WorkflowOutcome::StepLimitReached { response });
            }

            // Prefer a pending step already in the plan (seeded or inserted by
            // a modification); only consult the planner when none remains
            let step = match self.next_pending_step(&workflow) {
                Some(step) => step,
                None => match self.plan_step(workflow_id, &workflow).await? {
                    Some(step) => step,
                    None => {
                        // Completion signal from the planner
                        let response =
                            self.finalize(workflow_id, &summaries, WorkflowStatus::Completed).await?;
                        return Ok(WorkflowOutcome::Completed { response });
                    }
                },
            };

            self.mark_in_progress(workflow_id, step.step_number).await?;
            let (outcome, duration_ms) = self.dispatch(&step, &workflow.context).await;

            // The dispatch suspended; the workflow may have been cancelled or
            // paused underneath us. Check before recording anything.
            if let Fetched::Stopped(stopped) = self.checked_fetch(workflow_id).await? {
                tracing::info!(workflow_id, "workflow stopped mid-step; discarding result");
                return Ok(stopped);
            }

            let analysis = self
                .record_and_analyze(workflow_id, &step, &outcome, duration_ms)
                .await?;
            summaries.push(analysis.summary.clone());

            if analysis.loop_detected {
                tracing::warn!(workflow_id, "unproductive loop detected; concluding workflow");
            }

            if !analysis.should_continue {
                let response = self.finalize(workflow_id, &summaries, WorkflowStatus::Completed).await?;
                return Ok(WorkflowOutcome::Completed { response });
            }

            if !outcome.success {
                self.recover_from_failure(workflow_id, &step, &outcome).await;
            }
        }
    }

    /// Fetch the workflow and translate terminal/paused/cancelled states
    async fn checked_fetch(&self, workflow_id: &str) -> Result<Fetched> {
        if self.cancellation.is_cancelled() {
            self.store.cancel_workflow(workflow_id).await?;
            return Ok(Fetched::Stopped(WorkflowOutcome::Cancelled));
        }

        let Some(workflow) = self.store.get_workflow(workflow_id).await? else {
            // Expired or externally deleted; treat as cancellation
            tracing::warn!(workflow_id, "workflow disappeared from store");
            return Ok(Fetched::Stopped(WorkflowOutcome::Cancelled));
        };

        match workflow.status {
            WorkflowStatus::Active => Ok(Fetched::Running(workflow)),
            WorkflowStatus::Paused => Ok(Fetched::Stopped(WorkflowOutcome::Paused)),
            WorkflowStatus::Cancelled => Ok(Fetched::Stopped(WorkflowOutcome::Cancelled)),
            WorkflowStatus::Completed => Ok(Fetched::Stopped(WorkflowOutcome::Completed {
                response: String::new(),
            })),
            WorkflowStatus::Failed => Ok(Fetched::Stopped(WorkflowOutcome::Failed {
                response: Self::apology(),
            })),
        }
    }

    fn next_pending_step(&self, workflow: &WorkflowState) -> Option<WorkflowStep> {
        workflow
            .plan
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .cloned()
    }

    /// Ask the planner for the next step and append it to the plan
    ///
    /// Returns `None` on a completion signal. A planning failure is fatal for
    /// the workflow: no fallback step is fabricated.
    async fn plan_step(
        &self,
        workflow_id: &str,
        workflow: &WorkflowState,
    ) -> Result<Option<WorkflowStep>> {
        let planning_context = Self::planning_context(workflow, &self.config);

        let planned = match self.planner.plan_next_step(&planning_context).await {
            Ok(planned) => planned,
            Err(e) => {
                tracing::error!(workflow_id, "planning failed: {}", e);
                let _ = self.finalize(workflow_id, &[], WorkflowStatus::Failed).await;
                return Err(e);
            }
        };

        if planned.is_complete {
            return Ok(None);
        }

        let mut step = WorkflowStep::new(
            &planned.next_step,
            ToolCall::new(
                "dispatch",
                serde_json::json!({ "instruction": planned.next_step }),
            ),
            self.config.default_max_retries,
        );

        let _guard = self.locks.acquire(workflow_id).await;
        let Some(mut current) = self.store.get_workflow(workflow_id).await? else {
            return Ok(None);
        };
        if current.is_terminal() {
            return Ok(None);
        }
        current.plan.push(step.clone());
        current.renumber();
        step.step_number = current.total_steps;
        self.store.put_workflow(&current).await?;

        Ok(Some(step))
    }

    async fn mark_in_progress(&self, workflow_id: &str, step_number: usize) -> Result<()> {
        let _guard = self.locks.acquire(workflow_id).await;
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            return Ok(());
        };
        if let Some(step) = workflow.step_by_number_mut(step_number) {
            step.status = StepStatus::InProgress;
        }
        workflow.touch();
        self.store.put_workflow(&workflow).await
    }

    async fn dispatch(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
    ) -> (DispatchOutcome, u64) {
        let started = Instant::now();
        let outcome = match self.dispatcher.dispatch_step(step, context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(step = step.step_number, "dispatch errored: {}", e);
                DispatchOutcome {
                    output: format!("The step could not be executed: {}", e),
                    success: false,
                }
            }
        };
        (outcome, started.elapsed().as_millis() as u64)
    }

    /// Persist the step's result, advance progress, and analyze the outcome
    async fn record_and_analyze(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        outcome: &DispatchOutcome,
        duration_ms: u64,
    ) -> Result<StepAnalysis> {
        let analysis_context = {
            let _guard = self.locks.acquire(workflow_id).await;
            let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
                return Err(MaestroError::not_found(format!("workflow {}", workflow_id)));
            };

            if let Some(recorded) = workflow.step_by_number_mut(step.step_number) {
                recorded.status = if outcome.success {
                    StepStatus::Completed
                } else {
                    recorded.retry_count += 1;
                    StepStatus::Failed
                };
                recorded.result = Some(outcome.output.clone());
                recorded.duration_ms = Some(duration_ms);
            }
            workflow.current_step = workflow
                .plan
                .iter()
                .filter(|s| {
                    matches!(
                        s.status,
                        StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
                    )
                })
                .count()
                + 1;
            workflow.touch();
            self.store.put_workflow(&workflow).await?;

            Self::planning_context(&workflow, &self.config)
        };

        Ok(self
            .analyzer
            .analyze_step_result(&step.description, &outcome.output, &analysis_context)
            .await)
    }

    /// Ask the engine for recovery proposals and apply the confident ones
    async fn recover_from_failure(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        outcome: &DispatchOutcome,
    ) {
        let proposals = match self
            .engine
            .failure_recovery_modifications(
                workflow_id,
                step.step_number,
                &outcome.output,
                step.retry_count + 1,
            )
            .await
        {
            Ok(proposals) => proposals,
            Err(e) => {
                tracing::warn!(workflow_id, "failure recovery analysis unavailable: {}", e);
                return;
            }
        };

        let confident: Vec<_> = proposals
            .into_iter()
            .filter(|p| p.confidence >= self.config.modification_confidence_threshold)
            .collect();
        if confident.is_empty() {
            return;
        }

        match self.engine.apply_modifications(workflow_id, &confident).await {
            Ok(applied) => {
                tracing::info!(workflow_id, applied, "recovery modifications applied")
            }
            Err(e) => tracing::error!(workflow_id, "recovery application failed: {}", e),
        }
    }

    /// Write the terminal status and assemble the user-facing response
    async fn finalize(
        &self,
        workflow_id: &str,
        summaries: &[String],
        status: WorkflowStatus,
    ) -> Result<String> {
        {
            let _guard = self.locks.acquire(workflow_id).await;
            if let Some(mut workflow) = self.store.get_workflow(workflow_id).await? {
                if !workflow.is_terminal() {
                    workflow.status = status;
                    workflow.touch();
                    self.store.put_workflow(&workflow).await?;
                }
            }
        }
        self.locks.release(workflow_id).await;

        let response = match status {
            WorkflowStatus::Failed => Self::apology(),
            _ if summaries.is_empty() => "I've completed your request.".to_string(),
            _ => summaries.join("\n"),
        };
        Ok(response)
    }

    fn planning_context(workflow: &WorkflowState, config: &OrchestrationConfig) -> PlanningContext {
        let history = workflow.completed_history();
        PlanningContext {
            original_request: workflow.context.original_request.clone(),
            current_step: workflow.current_step,
            max_steps: config.max_steps_per_workflow,
            completed_steps: history.iter().map(|(step, _)| step.to_string()).collect(),
            step_results: history.iter().map(|(_, result)| result.to_string()).collect(),
        }
    }

    fn apology() -> String {
        "I'm sorry - I wasn't able to work out how to handle that request. Please try again."
            .to_string()
    }
}

enum Fetched {
    Running(WorkflowState),
    Stopped(WorkflowOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use crate::workflow::store::InMemoryWorkflowStore;
    use serde_json::json;
    use std::sync::Mutex;

    /// Dispatcher that serves scripted outcomes in order
    struct ScriptedDispatcher {
        outcomes: Mutex<Vec<DispatchOutcome>>,
        dispatched: Mutex<Vec<String>>,
    }

    impl ScriptedDispatcher {
        fn new(outcomes: Vec<(&str, bool)>) -> Self {
            Self {
                outcomes: Mutex::new(
                    outcomes
                        .into_iter()
                        .rev()
                        .map(|(output, success)| DispatchOutcome {
                            output: output.to_string(),
                            success,
                        })
                        .collect(),
                ),
                dispatched: Mutex::new(Vec::new()),
            }
        }

        fn dispatched_steps(&self) -> Vec<String> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentDispatcher for ScriptedDispatcher {
        async fn dispatch_step(
            &self,
            step: &WorkflowStep,
            _context: &WorkflowContext,
        ) -> Result<DispatchOutcome> {
            self.dispatched.lock().unwrap().push(step.description.clone());
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DispatchOutcome {
                    output: "done".to_string(),
                    success: true,
                }))
        }
    }

    fn driver_with(
        llm: MockLlm,
        dispatcher: Arc<ScriptedDispatcher>,
        max_steps: usize,
    ) -> (WorkflowDriver, Arc<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let config = OrchestrationConfig {
            max_steps_per_workflow: max_steps,
            ..OrchestrationConfig::default()
        };
        let driver = WorkflowDriver::new(Arc::new(llm), store.clone(), dispatcher, config);
        (driver, store)
    }

    fn plan_response(next_step: &str) -> serde_json::Value {
        json!({"nextStep": next_step, "isComplete": false})
    }

    fn complete_response() -> serde_json::Value {
        json!({"nextStep": "", "isComplete": true})
    }

    fn analysis_response(
        summary: &str,
        should_continue: bool,
        loop_detected: bool,
    ) -> serde_json::Value {
        json!({
            "summary": summary,
            "stepSucceeded": !loop_detected,
            "requestFulfilled": !should_continue && !loop_detected,
            "loopDetected": loop_detected,
            "shouldContinue": should_continue
        })
    }

    #[tokio::test]
    async fn test_happy_path_runs_to_completion() {
        let llm = MockLlm::new()
            .with_structured(plan_response("find John's contact info"))
            .with_structured(analysis_response("found John's email", true, false))
            .with_structured(plan_response("send John a calendar invite for tomorrow 10am"))
            .with_structured(analysis_response("invite sent for 10am", false, false));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            ("found john@acme.test", true),
            ("invite sent", true),
        ]));
        let (driver, store) = driver_with(llm, dispatcher.clone(), 10);

        let workflow = driver
            .start_workflow("session-1", "schedule a meeting with John tomorrow")
            .await
            .unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();

        match outcome {
            WorkflowOutcome::Completed { response } => {
                assert!(response.contains("invite sent for 10am"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.total_steps, 2);
        assert!(stored.plan.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(dispatcher.dispatched_steps().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_trip_loop_detection() {
        // Two semantically similar contact lookups both fail; the analyzer
        // flags a loop and the workflow concludes rather than retrying
        // forever.
        let llm = MockLlm::new()
            .with_structured(plan_response("find John's contact info"))
            .with_structured(analysis_response("contact lookup failed", true, false))
            .with_structured(json!([])) // failure recovery: nothing to propose
            .with_structured(plan_response("search the contact list for John"))
            // Contradictory raw output: the loop override must force a stop
            .with_structured(analysis_response("same lookup failed again", true, true));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            ("Unfortunately, contact not found", false),
            ("Unfortunately, contact not found", false),
        ]));
        let (driver, store) = driver_with(llm, dispatcher, 10);

        let workflow = driver
            .start_workflow("session-1", "schedule a meeting with John tomorrow")
            .await
            .unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();

        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));
        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.total_steps, 2);
        assert!(stored.plan.iter().all(|s| s.status == StepStatus::Failed));
    }

    #[tokio::test]
    async fn test_planning_failure_fails_the_workflow() {
        let llm = MockLlm::new().with_structured(json!({"nextStep": "", "isComplete": false}));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![]));
        let (driver, store) = driver_with(llm, dispatcher, 10);

        let workflow = driver
            .start_workflow("session-1", "do something")
            .await
            .unwrap();
        let err = driver.run_workflow(&workflow.workflow_id).await.unwrap_err();
        assert!(matches!(err, MaestroError::PlanningResponseInvalid { .. }));

        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_immediate_completion() {
        let llm = MockLlm::new().with_structured(complete_response());
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![]));
        let (driver, store) = driver_with(llm, dispatcher, 10);

        let workflow = driver.start_workflow("session-1", "thanks!").await.unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();

        assert_eq!(
            outcome,
            WorkflowOutcome::Completed {
                response: "I've completed your request.".to_string()
            }
        );
        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.total_steps, 0);
    }

    #[tokio::test]
    async fn test_step_ceiling_terminates_the_loop() {
        let llm = MockLlm::new()
            .with_structured(plan_response("step one"))
            .with_structured(analysis_response("one done", true, false))
            .with_structured(plan_response("step two"))
            .with_structured(analysis_response("two done", true, false));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![("ok", true), ("ok", true)]));
        let (driver, _store) = driver_with(llm, dispatcher, 2);

        let workflow = driver
            .start_workflow("session-1", "an endless request")
            .await
            .unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::StepLimitReached { .. }));
    }

    #[tokio::test]
    async fn test_pending_plan_steps_run_before_planner() {
        // Only analysis responses are scripted: executing a pre-seeded step
        // must not consult the planner at all
        let llm = MockLlm::new()
            .with_structured(analysis_response("pre-seeded step done", false, false));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![("did it", true)]));
        let (driver, store) = driver_with(llm, dispatcher.clone(), 10);

        let mut workflow = driver
            .start_workflow("session-1", "seeded request")
            .await
            .unwrap();
        workflow.plan.push(WorkflowStep::new(
            "pre-seeded step",
            ToolCall::new("calendar", json!({})),
            2,
        ));
        workflow.renumber();
        store.put_workflow(&workflow).await.unwrap();

        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));
        assert_eq!(dispatched_once(&dispatcher), "pre-seeded step");
    }

    fn dispatched_once(dispatcher: &ScriptedDispatcher) -> String {
        let steps = dispatcher.dispatched_steps();
        assert_eq!(steps.len(), 1);
        steps[0].clone()
    }

    #[tokio::test]
    async fn test_cancellation_mid_step_discards_result() {
        // A dispatcher that cancels the workflow while "executing": the
        // driver must notice on resumption and record nothing
        struct CancellingDispatcher {
            store: Arc<InMemoryWorkflowStore>,
        }

        #[async_trait]
        impl AgentDispatcher for CancellingDispatcher {
            async fn dispatch_step(
                &self,
                _step: &WorkflowStep,
                _context: &WorkflowContext,
            ) -> Result<DispatchOutcome> {
                // Tests run one workflow per session, so cancel everything
                // active while the step is "executing"
                let active = self.store.active_workflows("session-1").await?;
                for workflow in active {
                    self.store.cancel_workflow(&workflow.workflow_id).await?;
                }
                Ok(DispatchOutcome {
                    output: "too late".to_string(),
                    success: true,
                })
            }
        }

        let store = Arc::new(InMemoryWorkflowStore::new());
        let llm = MockLlm::new().with_structured(plan_response("long running step"));
        let driver = WorkflowDriver::new(
            Arc::new(llm),
            store.clone(),
            Arc::new(CancellingDispatcher { store: store.clone() }),
            OrchestrationConfig::default(),
        );

        let workflow = driver
            .start_workflow("session-1", "cancel me midway")
            .await
            .unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);

        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
        // The in-flight step's result was discarded
        assert!(stored.plan.iter().all(|s| s.result.is_none()));
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_the_loop() {
        let llm = MockLlm::new();
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![]));
        let (driver, store) = driver_with(llm, dispatcher, 10);

        let workflow = driver
            .start_workflow("session-1", "never starts")
            .await
            .unwrap();
        driver.cancellation_token().cancel();

        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_confident_recovery_modifications_are_applied() {
        let llm = MockLlm::new()
            .with_structured(plan_response("email John about the meeting"))
            .with_structured(analysis_response("email bounced", true, false))
            // Recovery: one confident proposal, one below threshold
            .with_structured(json!([
                {
                    "type": "add_step",
                    "changes": {"newSteps": [{"description": "message John on Slack instead", "toolName": "slack"}]},
                    "confidence": 0.9,
                    "priority": "high"
                },
                {
                    "type": "replace_plan",
                    "changes": {"replacementPlan": [{"description": "give up"}]},
                    "confidence": 0.2
                }
            ]))
            .with_structured(analysis_response("slack message delivered", false, false));
        let dispatcher = Arc::new(ScriptedDispatcher::new(vec![
            ("the email failed to send", false),
            ("slack message sent", true),
        ]));
        let (driver, store) = driver_with(llm, dispatcher.clone(), 10);

        let workflow = driver
            .start_workflow("session-1", "tell John about the meeting")
            .await
            .unwrap();
        let outcome = driver.run_workflow(&workflow.workflow_id).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed { .. }));

        // The confident add_step ran; the low-confidence replace_plan did not
        let steps = dispatcher.dispatched_steps();
        assert_eq!(
            steps,
            vec![
                "email John about the meeting".to_string(),
                "message John on Slack instead".to_string()
            ]
        );
        let stored = store.get_workflow(&workflow.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.total_steps, 2);
    }
}
