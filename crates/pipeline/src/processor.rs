// Video processing collaborator
//
// Steps call into a `VideoProcessor`; the engine never touches media.
// `MockVideoProcessor` simulates the work and the flaky thumbnail tool.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{TranscodeRequest, TranscodedAsset};

/// Media operations used by the pipeline steps
#[async_trait]
pub trait VideoProcessor: Send + Sync {
    /// Produce one rendition of the input
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodedAsset>;

    /// Extract a still image; returns its location
    async fn extract_thumbnail(&self, location: &str) -> Result<String>;

    /// Prepend the intro clip; returns the combined location
    async fn prepend_intro(&self, location: &str, intro_location: &str) -> Result<String>;

    /// Move approved files to their published location
    async fn publish(&self, locations: &[String]) -> Result<()>;

    /// Move rejected files out of the way
    async fn reject(&self, locations: &[String]) -> Result<()>;

    /// Remove intermediate files for a video that failed processing
    async fn cleanup(&self, video_location: &str) -> Result<()>;
}

/// A call made against the mock processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorCall {
    Transcode { location: String, bitrate: u32 },
    ExtractThumbnail { location: String },
    PrependIntro { location: String },
    Publish { locations: Vec<String> },
    Reject { locations: Vec<String> },
    Cleanup { location: String },
}

/// In-process stand-in for the media tooling
///
/// Failure plans are keyed by location: `fail_thumbnail_times("a.mp4", 2)`
/// makes the next two extractions for that location fail. A location
/// containing `error` always fails extraction.
pub struct MockVideoProcessor {
    work: Duration,
    thumbnail_failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ProcessorCall>>,
}

impl MockVideoProcessor {
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            thumbnail_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` thumbnail extractions for `location`
    pub fn fail_thumbnail_times(&self, location: impl Into<String>, times: u32) {
        self.thumbnail_failures.lock().insert(location.into(), times);
    }

    /// Every call so far, in call order
    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&ProcessorCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: ProcessorCall) {
        self.calls.lock().push(call);
    }

    async fn simulate_work(&self) {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
    }

    fn take_planned_failure(&self, location: &str) -> bool {
        let mut plans = self.thumbnail_failures.lock();
        match plans.get_mut(location) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for MockVideoProcessor {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// "media/clip.mov" -> "media/clip"
fn strip_extension(location: &str) -> &str {
    let name_start = location.rfind('/').map_or(0, |i| i + 1);
    match location[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &location[..name_start + dot],
        _ => location,
    }
}

#[async_trait]
impl VideoProcessor for MockVideoProcessor {
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodedAsset> {
        self.record(ProcessorCall::Transcode {
            location: request.input_location.clone(),
            bitrate: request.profile.bitrate,
        });
        tracing::info!(
            location = %request.input_location,
            bitrate = request.profile.bitrate,
            "transcoding"
        );
        self.simulate_work().await;

        Ok(TranscodedAsset {
            bitrate: request.profile.bitrate,
            location: format!(
                "{}-{}{}",
                strip_extension(&request.input_location),
                request.profile.bitrate,
                request.profile.output_extension
            ),
            output_extension: request.profile.output_extension.clone(),
        })
    }

    async fn extract_thumbnail(&self, location: &str) -> Result<String> {
        self.record(ProcessorCall::ExtractThumbnail {
            location: location.to_string(),
        });
        let attempt = self.count(|call| {
            matches!(call, ProcessorCall::ExtractThumbnail { location: l } if l == location)
        });
        tracing::info!(%location, attempt, "extracting thumbnail");

        if location.contains("error") || self.take_planned_failure(location) {
            bail!("failed to extract thumbnail from {location} on attempt {attempt}");
        }
        self.simulate_work().await;

        Ok(format!("{location}-thumbnail.jpg"))
    }

    async fn prepend_intro(&self, location: &str, intro_location: &str) -> Result<String> {
        self.record(ProcessorCall::PrependIntro {
            location: location.to_string(),
        });
        tracing::info!(%location, intro = %intro_location, "prepending intro");
        self.simulate_work().await;

        Ok(format!("{location}-with-intro.mp4"))
    }

    async fn publish(&self, locations: &[String]) -> Result<()> {
        self.record(ProcessorCall::Publish {
            locations: locations.to_vec(),
        });
        tracing::info!(?locations, "publishing video");
        self.simulate_work().await;
        Ok(())
    }

    async fn reject(&self, locations: &[String]) -> Result<()> {
        self.record(ProcessorCall::Reject {
            locations: locations.to_vec(),
        });
        tracing::info!(?locations, "rejecting video");
        self.simulate_work().await;
        Ok(())
    }

    async fn cleanup(&self, video_location: &str) -> Result<()> {
        self.record(ProcessorCall::Cleanup {
            location: video_location.to_string(),
        });
        tracing::info!(location = %video_location, "cleaning up");
        Ok(())
    }
}
