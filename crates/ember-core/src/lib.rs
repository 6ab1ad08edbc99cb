pub mod errors;
pub mod ids;
pub mod jobs;
pub mod session;

pub use errors::JobServiceError;
pub use ids::{JobId, SessionId};
pub use jobs::{ConnectionInfo, JobRequest, JobService, JobSnapshot, JobStatus};
pub use session::{FailureCause, Session, SessionState};
