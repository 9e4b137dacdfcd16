pub mod address;
pub mod checkout_session;
pub mod checkout_session_item;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod variant;

pub use checkout_session::SessionStatus;
pub use order::{OrderStatus, Transition};
pub use payment::PaymentStatus;
