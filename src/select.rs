use log::debug;
use thiserror::Error;

use crate::image::{BuildResult, Platform, SingleImage};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to find {platform} image in index for image: {identity}")]
pub struct NoMatchingPlatform {
    pub platform: Platform,
    pub identity: String,
}

/// Resolve exactly one image out of a build result.
///
/// A single image is returned as-is. For a collection, the first entry in stored order whose
/// platform matches `want` on both fields wins; entries without a platform are skipped.
/// No defaulting of `want` happens here.
pub fn select(
    result: &BuildResult,
    want: &Platform,
    identity: &str,
) -> Result<SingleImage, NoMatchingPlatform> {
    let collection = match result {
        BuildResult::Image(image) => return Ok(image.clone()),
        BuildResult::Collection(collection) => collection,
    };

    collection
        .entries
        .iter()
        .find(|entry| entry.platform.as_ref() == Some(want))
        .map(|entry| {
            debug!("selected {} for {want} from {}", entry.digest, collection.digest);
            collection.image(&entry.digest)
        })
        .ok_or_else(|| NoMatchingPlatform {
            platform: want.clone(),
            identity: identity.to_string(),
        })
}
