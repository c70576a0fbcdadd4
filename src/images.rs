//! Image capture for alerting instances.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::SchedulableRule;

/// A reference to a captured dashboard image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Opaque token identifying the stored image.
    pub token: String,
    /// Public URL of the image, if the capturer exposes one.
    pub url: Option<String>,
}

/// Errors that can occur while capturing an image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Screenshot capture is disabled in the embedding service.
    #[error("screenshots are unavailable")]
    ScreenshotsUnavailable,

    /// The rule has no dashboard or panel to capture.
    #[error("rule has no dashboard or panel configured")]
    NoDashboard,

    /// The capture itself failed.
    #[error("image capture failed: {0}")]
    CaptureFailed(String),
}

impl ImageError {
    /// Whether this error is an expected, benign condition rather than a
    /// failure worth reporting.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ScreenshotsUnavailable | Self::NoDashboard)
    }
}

/// Captures an image of the dashboard panel a rule is linked to.
///
/// Capture failures never fail an evaluation cycle; benign conditions
/// (disabled, unconfigured) are not even logged as errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageCapturer: Send + Sync {
    /// Captures a fresh image for the given rule.
    async fn new_image(&self, rule: &SchedulableRule) -> Result<ImageRef, ImageError>;
}

/// An [`ImageCapturer`] that always reports screenshots as unavailable.
///
/// The default wiring for embedders that do not support rendering.
#[derive(Debug, Default)]
pub struct NoopImageCapturer;

#[async_trait]
impl ImageCapturer for NoopImageCapturer {
    async fn new_image(&self, _rule: &SchedulableRule) -> Result<ImageRef, ImageError> {
        Err(ImageError::ScreenshotsUnavailable)
    }
}
