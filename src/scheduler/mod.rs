pub mod clock;
pub mod job;
pub mod lock;
pub mod machine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{Job, JobMeta, JobStatus, Repository};
pub use lock::{Lock, LockLedger, LockOutcome, LockState};
pub use machine::{
    Caller, JobStateMachine, LeaseGrant, Located, Report, RetryOutcome, Transition,
    DEFAULT_MAX_JOB_ATTEMPTS,
};
