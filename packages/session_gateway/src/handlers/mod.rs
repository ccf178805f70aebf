pub mod health;
pub mod instances;
pub mod messages;

// Re-export all handlers for easy route registration
pub use health::health_handler;
pub use instances::{
    create_instance, delete_instance, get_status, list_instances, logout_instance,
    restart_instance,
};
pub use messages::{send_message, send_receipts};
