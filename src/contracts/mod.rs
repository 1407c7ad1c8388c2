pub mod delivery;
pub mod processing_outcome;
pub mod request;

pub use delivery::{Body, Delivery, DeliveryInfo, Headers};
pub use processing_outcome::ProcessingOutcome;
pub use request::Request;
