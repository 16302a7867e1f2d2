//! Domain types: submissions, content units, verification runs, reports,
//! carrier submissions.

pub mod carrier;
pub mod report;
pub mod submission;
pub mod verification;

pub use carrier::{CarrierStatus, CarrierSubmission};
pub use report::{ApprovalLikelihood, ComplianceReport, UnitFinding};
pub use submission::{
    ContentUnit, Finding, Submission, SubmissionStatus, UnitEvaluation, UnitKind, UnitOutcome,
    Verdict,
};
pub use verification::{
    ErrorCode, Verification, VerificationSnapshot, VerificationStatus, VerificationStep,
};
