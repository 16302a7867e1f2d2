//! Verification pipeline.
//!
//! A run for a submission flows through:
//! 1. `GuidelineRetriever` for each business type (fallback document on a miss)
//! 2. `ScreeningRules::screen()`, fast pattern checks with no LLM
//! 3. `Evaluator::evaluate_unit()`, one bounded model call per content unit
//! 4. `ReportAssembler::assemble()`, scoring over determinate findings
//!
//! `VerificationMachine` drives the steps and owns the run record;
//! `StallSweeper` closes runs that stop making progress.

pub mod evaluator;
pub mod machine;
pub mod progress;
pub mod report;
pub mod screening;
pub mod sweep;

pub use evaluator::{Evaluator, UnitResult};
pub use machine::{RunOutcome, VerificationMachine};
pub use progress::ProgressEstimator;
pub use report::ReportAssembler;
pub use screening::{ScreenNote, ScreeningRules};
pub use sweep::{StallSweeper, SweepReport, spawn_pending_pickup, spawn_stall_sweep};
