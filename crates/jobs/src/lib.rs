pub mod config;
pub mod error;
pub mod group;
mod implicit;
pub mod job;
pub mod listener;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod monitor;
mod queue;
pub mod rule;
pub mod status;
mod worker;

pub use config::{load_dotenv, JobsConfig};
pub use error::{JobsError, Result};
pub use group::{default_group_result, GroupState, JobGroup, JobGroupBuilder};
pub use job::{Job, JobBuilder, JobContext, JobId, JobPriority, JobState};
pub use listener::{JobChangeEvent, JobChangeListener, JobEventKind};
pub use lock::{LockManager, OrderedLock};
pub use manager::{JobManager, YieldTarget};
pub use metrics::JobMetrics;
pub use monitor::{NullProgressMonitor, ProgressMonitor, ProgressProvider};
pub use rule::{same_rule, validate_rule, ExclusiveRule, MultiRule, PathRule, Rule, SchedulingRule};
pub use status::{JobStatus, Severity};
