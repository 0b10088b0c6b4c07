//! Resident notification queue.
//!
//! Rows are written synchronously by the operations that produce them and
//! drained by a periodic `NOTIFICATION_DELIVERY` process. Delivery is
//! at-least-once; the transport de-duplicates on the notification id.

mod dispatcher;
mod domain;
mod producer;
mod store;
mod transport;

pub use dispatcher::{DrainReport, NotificationDeliveryProcessor, NotificationDispatcher};
pub use domain::{Channel, NewNotification, NotificationEntry, NotificationError, NotificationStatus, SendWindow};
pub use producer::RefundNotificationProducer;
pub use store::{InMemoryNotificationStore, NotificationStore};
pub use transport::{LoggingTransport, NotificationTransport, RecordingTransport, TransportError};
