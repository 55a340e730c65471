pub mod assignments;
pub mod attempts;
pub mod backup_exchange;
pub mod core;
pub mod courses;
pub mod grading;
pub mod quizzes;
pub mod submissions;
