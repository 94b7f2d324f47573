pub mod api_handlers;
pub mod form;
pub mod health_handlers;
