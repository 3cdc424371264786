pub mod annotation;
pub mod conflict;
pub mod cursor;
pub mod events;
pub mod message;
pub mod notification;
pub mod operation;
pub mod presence;
pub mod room;

pub use annotation::{Annotation, AnnotationComment, AnnotationDraft, AnnotationStatus};
pub use conflict::{
    Conflict, ConflictResolution, ConflictSeverity, ConflictStatus, ConflictType,
    ResolutionAction, ResolutionStrategy,
};
pub use cursor::{CursorState, SelectionRange};
pub use message::{
    DeadLetterReason, MessagePriority, MessageStatus, QueueOwner, QueuedMessage,
};
pub use notification::{Notification, NotificationRequest};
pub use operation::{OperationEnvelope, StateVector, TextOperation};
pub use presence::{ActivityKind, PresenceRecord, PresenceStatus};
pub use room::{Room, RoomMember, RoomMetadata, RoomStats};
