pub mod execution_scope;
pub mod execution_status;
pub mod job_definition;
pub mod job_execution;
pub mod job_execution_history;
pub mod schedule_type;
