//! Jobs: data model, submission, claiming and settlement.

pub mod claim;
pub mod model;
pub mod pipeline;
pub mod submission;

pub use claim::ClaimEngine;
pub use model::{
    FetchOptions, FindJobsFilter, GroupConcurrency, Job, JobDetails, JobGroup, JobInsert,
    JobState, NewJob, SendOptions, StartAfter, StartAt,
};
pub use pipeline::JobPipeline;
pub use submission::Submission;
