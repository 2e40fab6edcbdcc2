pub mod handle;
pub mod store;

pub use handle::OverlayHandle;
pub use store::{OverlayError, OverlayStore};
