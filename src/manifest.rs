//! DASH manifest bitrate extraction.
//!
//! This is a permissive scanner over the raw MPD text, not an XML parser. It
//! only understands `<Representation ... bandwidth="N" ...>` tags, spelled
//! exactly like that.

use tracing::warn;

const REPRESENTATION_TAG: &str = "<Representation";
const BANDWIDTH_ATTR: &str = "bandwidth=\"";

/// Returns every representation bandwidth in the manifest, sorted ascending.
/// Duplicates are kept; unparsable values are skipped.
pub fn parse_bitrates(manifest: &str) -> Vec<u64> {
    let mut bitrates = Vec::new();
    let mut pos = 0;

    while let Some(found) = manifest[pos..].find(REPRESENTATION_TAG) {
        let tag_start = pos + found;
        let Some(tag_len) = manifest[tag_start..].find('>') else {
            break;
        };
        let tag = &manifest[tag_start..=tag_start + tag_len];

        if let Some(value) = attribute_value(tag, BANDWIDTH_ATTR) {
            match value.parse::<u64>() {
                Ok(rate) => bitrates.push(rate),
                Err(_) => warn!("Skipping representation with bandwidth {:?}", value),
            }
        }

        pos = tag_start + tag_len + 1;
    }

    bitrates.sort_unstable();
    bitrates
}

fn attribute_value<'a>(tag: &'a str, attr: &str) -> Option<&'a str> {
    let start = tag.find(attr)? + attr.len();
    let len = tag[start..].find('"')?;
    Some(&tag[start..start + len])
}
