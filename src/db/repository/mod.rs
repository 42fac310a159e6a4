pub mod event_repository;
pub mod notification_repository;

pub use event_repository::EventRepository;
pub use notification_repository::{InsertOutcome, NotificationRepository};
