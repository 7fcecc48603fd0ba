//! GATT peripheral server: advertisement, registration, request dispatch,
//! subscription tracking, and notification fan-out

pub mod advertiser;
pub mod connections;
pub mod dispatcher;
pub mod notifier;
pub mod registry;
pub mod writes;

pub use advertiser::{AdvertiseError, AdvertiseHandle, Advertiser};
pub use connections::{ConnectedDevice, ConnectionTracker, ProtocolError, SubscriptionChange};
pub use dispatcher::RequestDispatcher;
pub use notifier::{Notifier, NotifyError};
pub use registry::{RegistrationError, ServiceRegistry};
pub use writes::WriteReassembler;
