pub mod annotations;
pub mod cluster;
pub mod conflict;
pub mod cursor;
pub mod notifications;
pub mod ot;
pub mod presence;
pub mod queue;
pub mod resilience;
pub mod rest_api;
pub mod room_manager;
pub mod session;
pub mod throttle;

pub use annotations::AnnotationBroadcaster;
pub use cluster::ClusterAdapter;
pub use conflict::ConflictResolver;
pub use cursor::CursorTracker;
pub use notifications::NotificationDispatcher;
pub use ot::OtEngine;
pub use presence::PresenceTracker;
pub use queue::MessageQueue;
pub use rest_api::RestApiClient;
pub use room_manager::RoomManager;
pub use session::{Session, SessionGate};
