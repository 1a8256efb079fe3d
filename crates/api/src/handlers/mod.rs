pub mod deploy;
pub mod jobs;
