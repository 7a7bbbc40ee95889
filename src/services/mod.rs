//! Service layer: the storage allocator, the upload session manager, the
//! transform job scheduler, and the event bus they publish to.

pub mod allocator;
pub mod events;
pub mod transform_scheduler;
pub mod upload_manager;
