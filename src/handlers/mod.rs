pub mod health_handlers;
pub mod job_handlers;
pub mod transform_handlers;
pub mod upload_handlers;
