//! Read-side adapters over cached keys.
//!
//! Every view is a thin wrapper naming a [`KeyPath`](crate::cache::KeyPath);
//! the data itself lives in the client's store, so several views of one
//! collection stay consistent through the same invalidations.

mod all;
mod infinite;
mod paginated;
mod scoped;

pub use all::{AllView, collect_all};
pub use infinite::InfiniteView;
pub use paginated::{PaginatedView, decode_page};
pub use scoped::ScopedView;
