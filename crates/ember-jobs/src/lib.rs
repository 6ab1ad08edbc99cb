pub mod mock;
pub mod reliable;
pub mod runpod;

pub use mock::ScriptedJobService;
pub use reliable::{RetryConfig, RetryingJobService};
pub use runpod::{RunpodConfig, RunpodJobService};
