// Business logic over ShoutDatabase; every function takes the request's ViewerContext

pub mod accounts;
pub mod entry_visibility;
pub mod flag_aggregation;
pub mod moderation;
pub mod submission;
pub mod upload_manager;

pub use submission::{Submission, SubmissionHandler};
pub use upload_manager::UploadManager;
