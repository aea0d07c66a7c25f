pub mod model;
pub mod service;
pub mod store;

pub use model::{CartItem, CartSnapshot, PaymentSession, SessionStatus, TerminalStatus};
pub use service::SessionService;
pub use store::{CachedSessionStore, SessionStore};
