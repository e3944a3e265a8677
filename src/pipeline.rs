//! Contract for the background listing pipeline
//!
//! Deriving the final artwork and persisting the listing record happen
//! outside this crate; the session only consumes this request/response
//! contract. Implementations are expected to be slow (seconds) and are
//! always invoked off the session's event loop.

use async_trait::async_trait;

/// One captured reference photo of the item being listed.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub description: String,
}

/// Fully normalized listing draft handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ListingRequest {
    pub reference_images: Vec<ReferenceImage>,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub condition: String,
    pub brand: Option<String>,
    pub category: String,
    pub image_prompt: String,
}

#[derive(Debug, Clone)]
pub struct ListingOutcome {
    pub success: bool,
    pub listing_id: Option<String>,
    pub artifact_url: Option<String>,
    pub error: Option<String>,
}

impl ListingOutcome {
    pub fn ok(listing_id: impl Into<String>, artifact_url: impl Into<String>) -> Self {
        Self {
            success: true,
            listing_id: Some(listing_id.into()),
            artifact_url: Some(artifact_url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            listing_id: None,
            artifact_url: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ListingPipeline: Send + Sync {
    async fn create_listing(&self, request: ListingRequest) -> ListingOutcome;
}
