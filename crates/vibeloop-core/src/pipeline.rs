//! Extension pipeline.
//!
//! Each tick's message batch passes through two ordered stages:
//!
//! 1. `transform` - extensions may rewrite, add, drop or keep messages and
//!    see the output of every extension before them.
//! 2. `before_send` - light finalization right before dispatch.
//!
//! Extensions declare which stages they implement once, at registration;
//! the pipeline keeps a per-stage index list so undeclared hooks are never
//! called. A hook that fails, panics or overruns its budget has its output
//! discarded for that tick and the batch continues from the last good state.
//!
//! Caught panics still go through the process panic hook first. The default
//! hook prints a backtrace to stderr from the timing thread, so hosts
//! replace it with one that only logs (see [`panic_message`]).

use crate::error::{HookError, Stage};
use crate::message::{Message, SceneId};
use crate::metrics::{HookOutcome, HookSample, Metrics};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default per-hook time budget.
pub const DEFAULT_HOOK_BUDGET: Duration = Duration::from_micros(100);

/// Overruns and failures are logged on the first occurrence and then every
/// this many occurrences per extension.
const FAULT_LOG_EVERY: u64 = 100;

/// Which hooks an extension implements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub transform: bool,
    pub before_send: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        transform: false,
        before_send: false,
    };
    pub const TRANSFORM: Capabilities = Capabilities {
        transform: true,
        before_send: false,
    };
    pub const BEFORE_SEND: Capabilities = Capabilities {
        transform: false,
        before_send: true,
    };
    pub const BOTH: Capabilities = Capabilities {
        transform: true,
        before_send: true,
    };
}

/// A custom endpoint an extension wants the presentation layer to expose.
///
/// The core never serves these; it only reports them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    pub description: String,
}

/// Read-only tick information handed to `transform` hooks.
#[derive(Clone, Debug)]
pub struct TickContext {
    pub bpm: f64,
    pub step_index: u64,
    pub active_scene_id: Option<SceneId>,
    pub subdivision: u32,
    deadline: Instant,
}

impl TickContext {
    pub fn new(
        bpm: f64,
        step_index: u64,
        active_scene_id: Option<SceneId>,
        subdivision: u32,
    ) -> Self {
        Self {
            bpm,
            step_index,
            active_scene_id,
            subdivision: subdivision.max(1),
            deadline: Instant::now() + DEFAULT_HOOK_BUDGET,
        }
    }

    /// Deadline of the currently running hook.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the running hook overruns.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Long-running hooks should check this and bail out early.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Position in beats of this step.
    pub fn beat(&self) -> f64 {
        self.step_index as f64 / self.subdivision as f64
    }
}

/// Pluggable per-tick hooks.
///
/// Implement only the hooks declared in [`Extension::capabilities`].
pub trait Extension: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn transform(&mut self, _batch: &mut Vec<Message>, _ctx: &TickContext) -> Result<(), HookError> {
        Ok(())
    }

    fn before_send(
        &mut self,
        _batch: &mut Vec<Message>,
        _bpm: f64,
        _step_index: u64,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        Vec::new()
    }
}

/// How an extension was placed in the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Registration {
    pub name: String,
    pub priority: i32,
    pub capabilities: Capabilities,
    pub endpoints: Vec<Endpoint>,
}

/// Collects extensions before the pipeline order is frozen.
pub struct PipelineBuilder {
    entries: Vec<(i32, Box<dyn Extension>)>,
    hook_budget: Duration,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            hook_budget: DEFAULT_HOOK_BUDGET,
        }
    }

    pub fn hook_budget(&mut self, budget: Duration) -> &mut Self {
        self.hook_budget = budget;
        self
    }

    /// Add an extension; lower priorities run first, ties keep
    /// registration order.
    pub fn register<E: Extension + 'static>(&mut self, extension: E, priority: i32) -> &mut Self {
        self.register_boxed(Box::new(extension), priority)
    }

    pub fn register_boxed(&mut self, extension: Box<dyn Extension>, priority: i32) -> &mut Self {
        self.entries.push((priority, extension));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> Pipeline {
        let mut entries = self.entries;
        entries.sort_by_key(|(priority, _)| *priority);

        let mut slots = Vec::with_capacity(entries.len());
        let mut registrations = Vec::with_capacity(entries.len());
        let mut transform_stage = Vec::new();
        let mut before_send_stage = Vec::new();

        for (index, (priority, extension)) in entries.into_iter().enumerate() {
            let capabilities = extension.capabilities();
            if capabilities.transform {
                transform_stage.push(index);
            }
            if capabilities.before_send {
                before_send_stage.push(index);
            }
            registrations.push(Registration {
                name: extension.name().to_string(),
                priority,
                capabilities,
                endpoints: extension.endpoints(),
            });
            log::info!(
                "[PIPELINE] #{} '{}' priority={} transform={} before_send={}",
                index,
                extension.name(),
                priority,
                capabilities.transform,
                capabilities.before_send
            );
            slots.push(Slot {
                name: Arc::from(extension.name()),
                extension,
                faults: 0,
            });
        }

        Pipeline {
            slots,
            transform_stage,
            before_send_stage,
            registrations,
            hook_budget: self.hook_budget,
            scratch: Vec::new(),
        }
    }
}

struct Slot {
    name: Arc<str>,
    extension: Box<dyn Extension>,
    faults: u64,
}

/// Result of running one batch through the pipeline.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub messages: Vec<Message>,
    pub faults: Vec<HookError>,
}

/// Fixed-order extension pipeline, owned by the timing thread.
pub struct Pipeline {
    slots: Vec<Slot>,
    transform_stage: Vec<usize>,
    before_send_stage: Vec<usize>,
    registrations: Vec<Registration>,
    hook_budget: Duration,
    scratch: Vec<Message>,
}

impl Pipeline {
    /// A pipeline with no extensions (identity).
    pub fn empty() -> Self {
        PipelineBuilder::new().build()
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Extensions in execution order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn hook_budget(&self) -> Duration {
        self.hook_budget
    }

    /// Run `batch` through transform, then before_send.
    pub fn run(&mut self, batch: Vec<Message>, ctx: TickContext, metrics: &Metrics) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            messages: batch,
            faults: Vec::new(),
        };
        let mut ctx = ctx;

        for position in 0..self.transform_stage.len() {
            let index = self.transform_stage[position];
            self.invoke(index, Stage::Transform, &mut outcome, &mut ctx, metrics);
        }
        for position in 0..self.before_send_stage.len() {
            let index = self.before_send_stage[position];
            self.invoke(index, Stage::BeforeSend, &mut outcome, &mut ctx, metrics);
        }

        outcome
    }

    fn invoke(
        &mut self,
        index: usize,
        stage: Stage,
        outcome: &mut PipelineOutcome,
        ctx: &mut TickContext,
        metrics: &Metrics,
    ) {
        let budget = self.hook_budget;
        let Pipeline { slots, scratch, .. } = self;
        let slot = &mut slots[index];

        scratch.clone_from(&outcome.messages);
        let started = Instant::now();
        ctx.deadline = started + budget;

        let hook_ctx: &TickContext = ctx;
        let extension = &mut slot.extension;
        let result = panic::catch_unwind(AssertUnwindSafe(|| match stage {
            Stage::Transform => extension.transform(scratch, hook_ctx),
            Stage::BeforeSend => extension.before_send(scratch, hook_ctx.bpm, hook_ctx.step_index),
        }));
        let elapsed = started.elapsed();

        let fault = match result {
            Ok(Ok(())) if elapsed <= budget => {
                std::mem::swap(&mut outcome.messages, scratch);
                None
            }
            Ok(Ok(())) => Some(HookError::Timeout {
                extension: slot.name.to_string(),
                stage,
                elapsed,
                budget,
            }),
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(HookError::Failure {
                extension: slot.name.to_string(),
                stage,
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        };

        let hook_outcome = match &fault {
            None => HookOutcome::Ok,
            Some(HookError::Timeout { .. }) => HookOutcome::Timeout,
            Some(HookError::Failure { .. }) => HookOutcome::Failure,
        };
        metrics.record_hook(HookSample {
            extension: Arc::clone(&slot.name),
            stage,
            duration: elapsed,
            outcome: hook_outcome,
        });

        if let Some(fault) = fault {
            slot.faults += 1;
            if slot.faults == 1 || slot.faults % FAULT_LOG_EVERY == 0 {
                log::warn!(
                    "[PIPELINE] step {}: {} (discarded; {} faults so far)",
                    ctx.step_index,
                    fault,
                    slot.faults
                );
            }
            outcome.faults.push(fault);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("registrations", &self.registrations)
            .field("hook_budget", &self.hook_budget)
            .finish_non_exhaustive()
    }
}

/// Text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;

    /// Appends its tag to every message's `trace` parameter.
    struct Tag {
        name: String,
        capabilities: Capabilities,
    }

    impl Tag {
        fn new(name: &str, capabilities: Capabilities) -> Self {
            Self {
                name: name.to_string(),
                capabilities,
            }
        }

        fn apply(&self, batch: &mut [Message]) {
            for msg in batch {
                let trace = match msg.param("trace") {
                    Some(Value::Str(s)) => format!("{}{}", s, self.name),
                    _ => self.name.clone(),
                };
                msg.set_param("trace", trace);
            }
        }
    }

    impl Extension for Tag {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn transform(&mut self, batch: &mut Vec<Message>, _ctx: &TickContext) -> Result<(), HookError> {
            self.apply(batch);
            Ok(())
        }

        fn before_send(&mut self, batch: &mut Vec<Message>, _bpm: f64, _step: u64) -> Result<(), HookError> {
            self.apply(batch);
            Ok(())
        }
    }

    struct Faulty {
        mode: &'static str,
    }

    impl Extension for Faulty {
        fn name(&self) -> &str {
            self.mode
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::TRANSFORM
        }

        fn transform(&mut self, batch: &mut Vec<Message>, ctx: &TickContext) -> Result<(), HookError> {
            batch.clear();
            match self.mode {
                "panic" => panic!("boom at step {}", ctx.step_index),
                "error" => Err(HookError::failure("error", Stage::Transform, "bad input")),
                _ => {
                    while !ctx.expired() {
                        std::hint::spin_loop();
                    }
                    std::thread::sleep(Duration::from_micros(50));
                    Ok(())
                }
            }
        }
    }

    /// Budget generous enough that a preempted test thread never overruns.
    fn budgeted() -> PipelineBuilder {
        let mut builder = Pipeline::builder();
        builder.hook_budget(Duration::from_millis(50));
        builder
    }

    fn ctx(step: u64) -> TickContext {
        TickContext::new(120.0, step, None, 4)
    }

    fn batch() -> Vec<Message> {
        vec![Message::osc("/a"), Message::osc("/b")]
    }

    fn traces(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m.param("trace").and_then(Value::as_str).unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let mut pipeline = Pipeline::empty();
        assert_eq!(pipeline.hook_budget(), DEFAULT_HOOK_BUDGET);
        let outcome = pipeline.run(batch(), ctx(0), &Metrics::default());
        assert_eq!(outcome.messages, batch());
        assert!(outcome.faults.is_empty());
    }

    #[test]
    fn test_priority_then_registration_order() {
        let mut builder = budgeted();
        builder
            .register(Tag::new("c", Capabilities::TRANSFORM), 10)
            .register(Tag::new("a", Capabilities::TRANSFORM), 0)
            .register(Tag::new("b", Capabilities::TRANSFORM), 0);
        let mut pipeline = builder.build();

        let names: Vec<&str> = pipeline.registrations().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let outcome = pipeline.run(batch(), ctx(0), &Metrics::default());
        assert_eq!(traces(&outcome.messages), vec!["abc", "abc"]);
    }

    /// Runs two extensions back to back as one.
    struct Chain(Tag, Tag);

    impl Extension for Chain {
        fn name(&self) -> &str {
            "chain"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::TRANSFORM
        }

        fn transform(&mut self, batch: &mut Vec<Message>, ctx: &TickContext) -> Result<(), HookError> {
            self.0.transform(batch, ctx)?;
            self.1.transform(batch, ctx)
        }
    }

    #[test]
    fn test_composition_matches_combined_extension() {
        let mut builder = budgeted();
        builder
            .register(Tag::new("x", Capabilities::TRANSFORM), 0)
            .register(Tag::new("y", Capabilities::TRANSFORM), 1)
            .register(Tag::new("z", Capabilities::TRANSFORM), 2);
        let mut separate = builder.build();

        let mut builder = budgeted();
        builder
            .register(
                Chain(
                    Tag::new("x", Capabilities::TRANSFORM),
                    Tag::new("y", Capabilities::TRANSFORM),
                ),
                0,
            )
            .register(Tag::new("z", Capabilities::TRANSFORM), 1);
        let mut combined = builder.build();

        let metrics = Metrics::default();
        let a = separate.run(batch(), ctx(0), &metrics);
        let b = combined.run(batch(), ctx(0), &metrics);
        assert_eq!(a.messages, b.messages);
        assert_eq!(traces(&a.messages), vec!["xyz", "xyz"]);
    }

    #[test]
    fn test_transform_runs_before_before_send() {
        let mut builder = budgeted();
        builder
            .register(Tag::new("F", Capabilities::BEFORE_SEND), -100)
            .register(Tag::new("t", Capabilities::TRANSFORM), 100);
        let mut pipeline = builder.build();
        let outcome = pipeline.run(batch(), ctx(0), &Metrics::default());
        assert_eq!(traces(&outcome.messages), vec!["tF", "tF"]);
    }

    #[test]
    fn test_undeclared_hooks_are_not_called() {
        let mut builder = budgeted();
        builder
            .register(Tag::new("n", Capabilities::NONE), 0)
            .register(Tag::new("b", Capabilities::BOTH), 1);
        let mut pipeline = builder.build();
        let metrics = Metrics::default();
        let outcome = pipeline.run(batch(), ctx(0), &metrics);
        assert_eq!(traces(&outcome.messages), vec!["bb", "bb"]);
        assert_eq!(metrics.snapshot().hook_latency.count, 2);
    }

    #[test]
    fn test_panicking_hook_is_isolated() {
        let mut builder = budgeted();
        builder
            .register(Tag::new("a", Capabilities::TRANSFORM), 0)
            .register(Faulty { mode: "panic" }, 1)
            .register(Tag::new("b", Capabilities::TRANSFORM), 2);
        let mut pipeline = builder.build();
        let metrics = Metrics::default();

        let outcome = pipeline.run(batch(), ctx(5), &metrics);
        assert_eq!(traces(&outcome.messages), vec!["ab", "ab"]);
        assert_eq!(outcome.faults.len(), 1);
        assert!(outcome.faults[0].to_string().contains("boom at step 5"));
        assert_eq!(metrics.counters().hook_failures, 1);
    }

    #[test]
    fn test_failing_hook_contribution_discarded() {
        let mut builder = budgeted();
        builder.register(Faulty { mode: "error" }, 0);
        let mut pipeline = builder.build();
        let outcome = pipeline.run(batch(), ctx(0), &Metrics::default());
        assert_eq!(outcome.messages.len(), 2);
        assert!(matches!(outcome.faults[0], HookError::Failure { .. }));
    }

    #[test]
    fn test_overrunning_hook_is_discarded() {
        let mut builder = budgeted();
        builder
            .hook_budget(Duration::from_micros(200))
            .register(Faulty { mode: "slow" }, 0)
            .register(Tag::new("z", Capabilities::BEFORE_SEND), 1);
        let mut pipeline = builder.build();
        let metrics = Metrics::default();

        let outcome = pipeline.run(batch(), ctx(0), &metrics);
        assert_eq!(traces(&outcome.messages), vec!["z", "z"]);
        assert!(matches!(outcome.faults[0], HookError::Timeout { .. }));
        assert_eq!(metrics.counters().hook_timeouts, 1);
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("step {}", 5));
        assert_eq!(panic_message(payload.as_ref()), "step 5");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_context_beat() {
        let ctx = TickContext::new(120.0, 6, None, 4);
        assert!((ctx.beat() - 1.5).abs() < 1e-9);
        assert!(ctx.remaining() <= DEFAULT_HOOK_BUDGET);
    }
}
