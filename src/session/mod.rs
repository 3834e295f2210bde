//! Generic session store and the callback channel built on top of it.

mod callback;
mod store;

pub use callback::{CallbackChannel, CapturedCallback, RawRequest};
pub use store::{DeletionHook, Session, SessionStore};
