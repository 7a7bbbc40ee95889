//! HTTP handlers for the upload, transform, admin, and health surfaces.

pub mod admin_handlers;
pub mod health_handlers;
pub mod transform_handlers;
pub mod upload_handlers;

use crate::services::{
    allocator::StorageAllocator, transform_scheduler::TransformScheduler,
    upload_manager::UploadManager,
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadManager>,
    pub transforms: Arc<TransformScheduler>,
    pub allocator: Arc<StorageAllocator>,
}
